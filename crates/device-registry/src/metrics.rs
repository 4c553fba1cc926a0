use crate::{DeviceDescriptor, MetricsError};
use prometheus::{Encoder, GaugeVec, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const LABEL_ADDR: &str = "knx_addr";
pub const LABEL_NAME: &str = "name";
pub const LABEL_MAINGROUP: &str = "knx_maingroup";
pub const LABEL_MIDDLEGROUP: &str = "knx_middlegroup";
pub const LABEL_SUBGROUP: &str = "knx_subgroup";

const LABEL_NAMES: [&str; 5] = [
    LABEL_ADDR,
    LABEL_NAME,
    LABEL_MAINGROUP,
    LABEL_MIDDLEGROUP,
    LABEL_SUBGROUP,
];

/// Name and help text of the gauge family a decoder writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricSpec {
    pub name: &'static str,
    pub help: &'static str,
}

/// Label-set identifying one device series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesLabels {
    pub addr: String,
    pub name: String,
    pub maingroup: String,
    pub middlegroup: String,
    pub subgroup: String,
}

impl SeriesLabels {
    pub fn for_device(desc: &DeviceDescriptor) -> Self {
        let (main, middle, sub) = (
            desc.address.main(),
            desc.address.middle(),
            desc.address.sub(),
        );
        Self {
            addr: format!("{main}_{middle}_{sub}"),
            name: desc.name.clone(),
            maingroup: main.to_string(),
            middlegroup: middle.to_string(),
            subgroup: sub.to_string(),
        }
    }

    fn values(&self) -> [&str; 5] {
        [
            self.addr.as_str(),
            self.name.as_str(),
            self.maingroup.as_str(),
            self.middlegroup.as_str(),
            self.subgroup.as_str(),
        ]
    }

    fn from_pairs(pairs: &[prometheus::proto::LabelPair]) -> Self {
        let mut labels = SeriesLabels {
            addr: String::new(),
            name: String::new(),
            maingroup: String::new(),
            middlegroup: String::new(),
            subgroup: String::new(),
        };
        for pair in pairs {
            let slot = match pair.get_name() {
                LABEL_ADDR => &mut labels.addr,
                LABEL_NAME => &mut labels.name,
                LABEL_MAINGROUP => &mut labels.maingroup,
                LABEL_MIDDLEGROUP => &mut labels.middlegroup,
                LABEL_SUBGROUP => &mut labels.subgroup,
                _ => continue,
            };
            *slot = pair.get_value().to_string();
        }
        labels
    }
}

/// One series as seen by a scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSample {
    pub metric: String,
    pub labels: SeriesLabels,
    pub value: f64,
}

/// Counters describing the bridge itself.
#[derive(Clone)]
pub struct BridgeMetrics {
    pub telegrams_received: IntCounter,
    pub telegrams_matched: IntCounter,
    pub decode_errors: IntCounter,
    pub read_requests_sent: IntCounter,
    pub devices_loaded: IntGauge,
}

impl BridgeMetrics {
    fn register(registry: &Registry) -> Result<Self, MetricsError> {
        let telegrams_received = IntCounter::new(
            "knx_telegrams_received_total",
            "Total group telegrams received from the bus",
        )?;
        let telegrams_matched = IntCounter::new(
            "knx_telegrams_matched_total",
            "Group telegrams addressed to a configured device",
        )?;
        let decode_errors = IntCounter::new(
            "knx_decode_errors_total",
            "Telegrams whose payload could not be decoded",
        )?;
        let read_requests_sent = IntCounter::new(
            "knx_read_requests_sent_total",
            "Group read requests sent to seed device values",
        )?;
        let devices_loaded =
            IntGauge::new("knx_devices_loaded", "Number of device descriptors loaded")?;
        registry.register(Box::new(telegrams_received.clone()))?;
        registry.register(Box::new(telegrams_matched.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(read_requests_sent.clone()))?;
        registry.register(Box::new(devices_loaded.clone()))?;
        Ok(Self {
            telegrams_received,
            telegrams_matched,
            decode_errors,
            read_requests_sent,
            devices_loaded,
        })
    }
}

/// Last-known value of every device series, safe to share across tasks.
///
/// Each family is a prometheus `GaugeVec`: setting an existing series only
/// takes the family's read lock and stores the value atomically, so writers
/// to different series never wait on each other and readers never observe a
/// partially written value.
///
/// The [`BridgeMetrics`] counters live in the same registry but are not device
/// series: [`snapshot`] leaves them out, so counting an unmatched telegram does
/// not write to the device series.
///
/// [`snapshot`]: MetricStore::snapshot
pub struct MetricStore {
    registry: Registry,
    families: RwLock<HashMap<&'static str, GaugeVec>>,
    bridge: BridgeMetrics,
}

impl MetricStore {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let bridge = BridgeMetrics::register(&registry)?;
        Ok(Self {
            registry,
            families: RwLock::new(HashMap::new()),
            bridge,
        })
    }

    pub fn bridge(&self) -> &BridgeMetrics {
        &self.bridge
    }

    /// Register the gauge family for `spec`. Idempotent.
    pub fn register_family(&self, spec: &MetricSpec) -> Result<GaugeVec, MetricsError> {
        let mut families = self.write_families();
        if let Some(existing) = families.get(spec.name) {
            return Ok(existing.clone());
        }
        let gauge = GaugeVec::new(Opts::new(spec.name, spec.help), &LABEL_NAMES)?;
        self.registry.register(Box::new(gauge.clone()))?;
        families.insert(spec.name, gauge.clone());
        Ok(gauge)
    }

    /// Create or replace the series identified by `labels` in family `spec`.
    pub fn upsert(
        &self,
        spec: &MetricSpec,
        labels: &SeriesLabels,
        value: f64,
    ) -> Result<(), MetricsError> {
        let existing = self.read_families().get(spec.name).cloned();
        let family = match existing {
            Some(family) => family,
            None => self.register_family(spec)?,
        };
        family.get_metric_with_label_values(&labels.values())?.set(value);
        Ok(())
    }

    /// Point-in-time copy of all device series, ordered by metric then labels.
    pub fn snapshot(&self) -> Vec<SeriesSample> {
        let names: Vec<&'static str> = self.read_families().keys().copied().collect();
        let mut out = Vec::new();
        for family in self.registry.gather() {
            if !names.iter().any(|n| *n == family.get_name()) {
                continue;
            }
            for metric in family.get_metric() {
                out.push(SeriesSample {
                    metric: family.get_name().to_string(),
                    labels: SeriesLabels::from_pairs(metric.get_label()),
                    value: metric.get_gauge().get_value(),
                });
            }
        }
        out.sort_by(|a, b| (&a.metric, &a.labels).cmp(&(&b.metric, &b.labels)));
        out
    }

    /// Prometheus text exposition of every registered family.
    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    fn read_families(&self) -> RwLockReadGuard<'_, HashMap<&'static str, GaugeVec>> {
        self.families.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_families(&self) -> RwLockWriteGuard<'_, HashMap<&'static str, GaugeVec>> {
        self.families.write().unwrap_or_else(|e| e.into_inner())
    }
}
