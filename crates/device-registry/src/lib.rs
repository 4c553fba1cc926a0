//! device-registry: YAML-driven registry of KNX devices, datapoint decoders and
//! the metric store their values land in

mod types;
pub use types::*;

mod error;
pub use error::{ConfigError, DecodeError, EncodeError, MetricsError};

mod loader;
pub use loader::{load_device_file, load_registry, Device, DeviceRegistry};

mod metrics;
pub use metrics::{
    BridgeMetrics, MetricSpec, MetricStore, SeriesLabels, SeriesSample, LABEL_ADDR,
    LABEL_MAINGROUP, LABEL_MIDDLEGROUP, LABEL_NAME, LABEL_SUBGROUP,
};

mod encode;
pub use encode::{encode_dpt1, encode_dpt9};

mod decode;
pub use decode::{
    decode_dpt9, DatapointDecoder, DecodedValue, DecoderTable, Dpt1001, Dpt9001,
    SWITCH_METRIC, TEMPERATURE_METRIC,
};
