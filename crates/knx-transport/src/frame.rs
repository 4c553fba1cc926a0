//! KNXnet/IP tunnelling frames and the cEMI link-layer payload they carry.

use crate::{GroupAddress, GroupCommand, GroupEvent, IndividualAddress, Result, TransportError};

const HEADER_LEN: usize = 6;
const PROTOCOL_VERSION: u8 = 0x10;

const CONNECT_REQUEST: u16 = 0x0205;
const CONNECT_RESPONSE: u16 = 0x0206;
const CONNECTIONSTATE_REQUEST: u16 = 0x0207;
const CONNECTIONSTATE_RESPONSE: u16 = 0x0208;
const DISCONNECT_REQUEST: u16 = 0x0209;
const DISCONNECT_RESPONSE: u16 = 0x020A;
const TUNNELING_REQUEST: u16 = 0x0420;
const TUNNELING_ACK: u16 = 0x0421;

/// Route-back HPAI: the gateway replies to the datagram's source endpoint.
const HPAI_ROUTE_BACK: [u8; 8] = [0x08, 0x01, 0, 0, 0, 0, 0, 0];
/// Connection request info: tunnel connection, link layer.
const CRI_TUNNEL_LINKLAYER: [u8; 4] = [0x04, 0x04, 0x02, 0x00];

const L_DATA_REQ: u8 = 0x11;
const L_DATA_IND: u8 = 0x29;

// Standard frame, no repeat, broadcast, low priority.
const CTRL1_STANDARD: u8 = 0xBC;
// Group destination, hop count 6.
const CTRL2_GROUP: u8 = 0xE0;
const MAX_STANDARD_NPDU: usize = 15;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    ConnectRequest,
    ConnectResponse { channel: u8, status: u8 },
    ConnStateRequest { channel: u8 },
    ConnStateResponse { channel: u8, status: u8 },
    DisconnectRequest { channel: u8 },
    DisconnectResponse { channel: u8, status: u8 },
    TunnelRequest { channel: u8, seq: u8, cemi: Vec<u8> },
    TunnelAck { channel: u8, seq: u8, status: u8 },
}

impl Frame {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let (service, body): (u16, Vec<u8>) = match self {
            Frame::ConnectRequest => {
                let mut b = Vec::with_capacity(20);
                b.extend_from_slice(&HPAI_ROUTE_BACK);
                b.extend_from_slice(&HPAI_ROUTE_BACK);
                b.extend_from_slice(&CRI_TUNNEL_LINKLAYER);
                (CONNECT_REQUEST, b)
            }
            Frame::ConnectResponse { channel, status } => {
                (CONNECT_RESPONSE, vec![*channel, *status])
            }
            Frame::ConnStateRequest { channel } => {
                (CONNECTIONSTATE_REQUEST, with_hpai(*channel))
            }
            Frame::ConnStateResponse { channel, status } => {
                (CONNECTIONSTATE_RESPONSE, vec![*channel, *status])
            }
            Frame::DisconnectRequest { channel } => (DISCONNECT_REQUEST, with_hpai(*channel)),
            Frame::DisconnectResponse { channel, status } => {
                (DISCONNECT_RESPONSE, vec![*channel, *status])
            }
            Frame::TunnelRequest { channel, seq, cemi } => {
                let mut b = Vec::with_capacity(4 + cemi.len());
                b.extend_from_slice(&[0x04, *channel, *seq, 0x00]);
                b.extend_from_slice(cemi);
                (TUNNELING_REQUEST, b)
            }
            Frame::TunnelAck {
                channel,
                seq,
                status,
            } => (TUNNELING_ACK, vec![0x04, *channel, *seq, *status]),
        };
        let total = (HEADER_LEN + body.len()) as u16;
        let mut out = Vec::with_capacity(total as usize);
        out.extend_from_slice(&[HEADER_LEN as u8, PROTOCOL_VERSION]);
        out.extend_from_slice(&service.to_be_bytes());
        out.extend_from_slice(&total.to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Frame> {
        if buf.len() < HEADER_LEN {
            return Err(TransportError::InvalidFrame("short header"));
        }
        if buf[0] as usize != HEADER_LEN || buf[1] != PROTOCOL_VERSION {
            return Err(TransportError::InvalidFrame("unknown header"));
        }
        let service = u16::from_be_bytes([buf[2], buf[3]]);
        let total = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if total < HEADER_LEN || total > buf.len() {
            return Err(TransportError::InvalidFrame("length mismatch"));
        }
        let body = &buf[HEADER_LEN..total];
        let need = |n: usize| {
            if body.len() < n {
                Err(TransportError::InvalidFrame("short body"))
            } else {
                Ok(())
            }
        };
        match service {
            CONNECT_REQUEST => Ok(Frame::ConnectRequest),
            CONNECT_RESPONSE => {
                need(2)?;
                Ok(Frame::ConnectResponse {
                    channel: body[0],
                    status: body[1],
                })
            }
            CONNECTIONSTATE_REQUEST => {
                need(1)?;
                Ok(Frame::ConnStateRequest { channel: body[0] })
            }
            CONNECTIONSTATE_RESPONSE => {
                need(2)?;
                Ok(Frame::ConnStateResponse {
                    channel: body[0],
                    status: body[1],
                })
            }
            DISCONNECT_REQUEST => {
                need(1)?;
                Ok(Frame::DisconnectRequest { channel: body[0] })
            }
            DISCONNECT_RESPONSE => {
                need(2)?;
                Ok(Frame::DisconnectResponse {
                    channel: body[0],
                    status: body[1],
                })
            }
            TUNNELING_REQUEST | TUNNELING_ACK => {
                need(4)?;
                let conn_len = body[0] as usize;
                if conn_len < 4 || conn_len > body.len() {
                    return Err(TransportError::InvalidFrame("connection header"));
                }
                let (channel, seq) = (body[1], body[2]);
                if service == TUNNELING_ACK {
                    Ok(Frame::TunnelAck {
                        channel,
                        seq,
                        status: body[3],
                    })
                } else {
                    Ok(Frame::TunnelRequest {
                        channel,
                        seq,
                        cemi: body[conn_len..].to_vec(),
                    })
                }
            }
            _ => Err(TransportError::InvalidFrame("unsupported service")),
        }
    }
}

fn with_hpai(channel: u8) -> Vec<u8> {
    let mut b = Vec::with_capacity(10);
    b.extend_from_slice(&[channel, 0x00]);
    b.extend_from_slice(&HPAI_ROUTE_BACK);
    b
}

/// Encode a group telegram as a cEMI `L_Data.req`.
pub(crate) fn encode_ldata_req(event: &GroupEvent) -> Result<Vec<u8>> {
    let apci = event.command.apci();
    let dst = event.destination.raw().to_be_bytes();
    let src = event.source.raw().to_be_bytes();
    let mut out = vec![
        L_DATA_REQ,
        0x00,
        CTRL1_STANDARD,
        CTRL2_GROUP,
        src[0],
        src[1],
        dst[0],
        dst[1],
    ];
    let tpci = ((apci >> 8) & 0x03) as u8;
    let apci_lo = (apci & 0xFF) as u8;
    match (event.command, event.data.as_slice()) {
        (GroupCommand::Read, _) | (_, []) => {
            out.extend_from_slice(&[1, tpci, apci_lo]);
        }
        (_, [small]) if *small <= 0x3F => {
            out.extend_from_slice(&[1, tpci, apci_lo | small]);
        }
        (_, data) => {
            let npdu_len = 1 + data.len();
            if npdu_len > MAX_STANDARD_NPDU {
                return Err(TransportError::PayloadTooLong(data.len()));
            }
            out.extend_from_slice(&[npdu_len as u8, tpci, apci_lo]);
            out.extend_from_slice(data);
        }
    }
    Ok(out)
}

/// Decode a cEMI frame into a group telegram.
///
/// Returns `Ok(None)` for frames that are not group-addressed `L_Data.ind`
/// value services (confirmations, point-to-point traffic, management).
pub(crate) fn decode_ldata(buf: &[u8]) -> Result<Option<GroupEvent>> {
    if buf.len() < 2 {
        return Err(TransportError::InvalidFrame("short cemi"));
    }
    if buf[0] != L_DATA_IND {
        return Ok(None);
    }
    let base = 2 + buf[1] as usize;
    if buf.len() < base + 9 {
        return Err(TransportError::InvalidFrame("short cemi"));
    }
    let ctrl2 = buf[base + 1];
    if ctrl2 & 0x80 == 0 {
        return Ok(None);
    }
    let source = IndividualAddress::from_raw(u16::from_be_bytes([buf[base + 2], buf[base + 3]]));
    let destination = GroupAddress::from_raw(u16::from_be_bytes([buf[base + 4], buf[base + 5]]));
    let npdu_len = buf[base + 6] as usize;
    if npdu_len == 0 || buf.len() < base + 8 + npdu_len {
        return Err(TransportError::InvalidFrame("npdu length"));
    }
    let tpci = buf[base + 7];
    let apci_lo = buf[base + 8];
    let apci = (u16::from(tpci & 0x03) << 8) | u16::from(apci_lo);
    let command = match GroupCommand::from_apci(apci) {
        Some(c) => c,
        None => return Ok(None),
    };
    let data = match (command, npdu_len) {
        (GroupCommand::Read, _) => Vec::new(),
        (_, 1) => vec![apci_lo & 0x3F],
        (_, n) => buf[base + 9..base + 8 + n].to_vec(),
    };
    Ok(Some(GroupEvent {
        command,
        source,
        destination,
        data,
        received_at: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ga(main: u8, middle: u8, sub: u8) -> GroupAddress {
        GroupAddress::new(main, middle, sub).unwrap()
    }

    #[test]
    fn connect_request_layout() {
        let bytes = Frame::ConnectRequest.encode();
        assert_eq!(bytes.len(), 26);
        assert_eq!(&bytes[..6], &[0x06, 0x10, 0x02, 0x05, 0x00, 0x1A]);
        assert_eq!(&bytes[22..], &CRI_TUNNEL_LINKLAYER);
    }

    #[test]
    fn decodes_connect_response() {
        let raw = [
            0x06, 0x10, 0x02, 0x06, 0x00, 0x14, 0x15, 0x00, 0x08, 0x01, 192, 168, 1, 144, 0x0E,
            0x57, 0x04, 0x04, 0x11, 0xFF,
        ];
        assert_eq!(
            Frame::decode(&raw).unwrap(),
            Frame::ConnectResponse {
                channel: 0x15,
                status: 0
            }
        );
    }

    #[test]
    fn rejects_truncated_datagram() {
        let raw = [0x06, 0x10, 0x04, 0x21, 0x00, 0x0A, 0x04, 0x01];
        assert!(Frame::decode(&raw).is_err());
        assert!(Frame::decode(&[0x06, 0x10]).is_err());
    }

    #[test]
    fn tunnel_ack_layout() {
        let bytes = Frame::TunnelAck {
            channel: 7,
            seq: 42,
            status: 0,
        }
        .encode();
        assert_eq!(
            bytes,
            vec![0x06, 0x10, 0x04, 0x21, 0x00, 0x0A, 0x04, 7, 42, 0]
        );
        assert_eq!(
            Frame::decode(&bytes).unwrap(),
            Frame::TunnelAck {
                channel: 7,
                seq: 42,
                status: 0
            }
        );
    }

    #[test]
    fn group_read_request_cemi() {
        let cemi = encode_ldata_req(&GroupEvent::read(ga(1, 2, 3))).unwrap();
        assert_eq!(
            cemi,
            vec![0x11, 0x00, 0xBC, 0xE0, 0x00, 0x00, 0x0A, 0x03, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn small_write_is_packed_into_apci() {
        let cemi = encode_ldata_req(&GroupEvent::write(ga(0, 0, 1), &[1])).unwrap();
        assert_eq!(&cemi[8..], &[0x01, 0x00, 0x81]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let ev = GroupEvent::write(ga(0, 0, 1), &[0u8; 15]);
        assert!(matches!(
            encode_ldata_req(&ev),
            Err(TransportError::PayloadTooLong(15))
        ));
    }

    #[test]
    fn decodes_two_byte_write_indication() {
        // 1.1.5 -> 1/2/3, GroupValueWrite 0x0C33 (21.5 as DPT 9)
        let raw = [
            0x29, 0x00, 0xBC, 0xE0, 0x11, 0x05, 0x0A, 0x03, 0x03, 0x00, 0x80, 0x0C, 0x33,
        ];
        let ev = decode_ldata(&raw).unwrap().unwrap();
        assert_eq!(ev.command, GroupCommand::Write);
        assert_eq!(ev.source.to_string(), "1.1.5");
        assert_eq!(ev.destination, ga(1, 2, 3));
        assert_eq!(ev.data, vec![0x0C, 0x33]);
    }

    #[test]
    fn decodes_packed_response_indication() {
        let raw = [
            0x29, 0x00, 0xBC, 0xE0, 0x11, 0x05, 0x0A, 0x03, 0x01, 0x00, 0x41,
        ];
        let ev = decode_ldata(&raw).unwrap().unwrap();
        assert_eq!(ev.command, GroupCommand::Response);
        assert_eq!(ev.data, vec![0x01]);
    }

    #[test]
    fn skips_additional_info_block() {
        let raw = [
            0x29, 0x02, 0xAA, 0xBB, 0xBC, 0xE0, 0x11, 0x05, 0x0A, 0x03, 0x01, 0x00, 0x00,
        ];
        let ev = decode_ldata(&raw).unwrap().unwrap();
        assert_eq!(ev.command, GroupCommand::Read);
        assert!(ev.data.is_empty());
    }

    #[test]
    fn ignores_confirmations_and_individual_destinations() {
        let con = [
            0x2E, 0x00, 0xBC, 0xE0, 0x11, 0x05, 0x0A, 0x03, 0x01, 0x00, 0x00,
        ];
        assert!(decode_ldata(&con).unwrap().is_none());
        let p2p = [
            0x29, 0x00, 0xBC, 0x60, 0x11, 0x05, 0x11, 0x06, 0x01, 0x00, 0x80,
        ];
        assert!(decode_ldata(&p2p).unwrap().is_none());
    }
}
