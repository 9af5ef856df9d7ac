//! Sample key codec (C1): canonical serialization of a [`SampleIdentity`]
//! into a stable byte key, and derivation of network-backend storage keys
//! from it.

use super::{AggregationMode, MetricType, Pid, SampleIdentity};
use crate::error::CoreError;
use xxhash_rust::xxh3::xxh3_128;

/// Which record a network-backend storage key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Metric,
    Meta,
}

impl KeyKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Meta => "meta",
        }
    }
}

fn write_field(buf: &mut Vec<u8>, field: &str) {
    let bytes = field.as_bytes();
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn read_field<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<&'a str, CoreError> {
    let len_bytes = bytes
        .get(*cursor..*cursor + 4)
        .ok_or_else(|| CoreError::MalformedKey("truncated field length".to_string()))?;
    let len = u32::from_le_bytes(
        len_bytes
            .try_into()
            .map_err(|_| CoreError::MalformedKey("bad field length".to_string()))?,
    ) as usize;
    *cursor += 4;

    let field_bytes = bytes
        .get(*cursor..*cursor + len)
        .ok_or_else(|| CoreError::MalformedKey("truncated field body".to_string()))?;
    *cursor += len;

    std::str::from_utf8(field_bytes)
        .map_err(|e| CoreError::MalformedKey(format!("non-utf8 field: {e}")))
}

/// Deterministic encoding of a [`SampleIdentity`]: two identities that
/// compare equal (labels compared order-independently) encode to the same
/// bytes (testable property 6).
pub fn encode_sid(sid: &SampleIdentity) -> Vec<u8> {
    let mut labels = sid.labels.clone();
    labels.sort_by(|a, b| a.0.cmp(&b.0));

    let mut buf = Vec::new();
    write_field(&mut buf, &sid.metric_name);
    write_field(&mut buf, &sid.sample_name);

    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(labels.len() as u32).to_le_bytes());
    for (name, value) in &labels {
        write_field(&mut buf, name);
        write_field(&mut buf, value);
    }

    write_field(&mut buf, &sid.help_text);
    buf
}

/// Total inverse of [`encode_sid`].
pub fn decode_sid(bytes: &[u8]) -> Result<SampleIdentity, CoreError> {
    let mut cursor = 0usize;
    let metric_name = read_field(bytes, &mut cursor)?.to_string();
    let sample_name = read_field(bytes, &mut cursor)?.to_string();

    let count_bytes = bytes
        .get(cursor..cursor + 4)
        .ok_or_else(|| CoreError::MalformedKey("truncated label count".to_string()))?;
    let count = u32::from_le_bytes(
        count_bytes
            .try_into()
            .map_err(|_| CoreError::MalformedKey("bad label count".to_string()))?,
    );
    cursor += 4;

    let mut labels = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_field(bytes, &mut cursor)?.to_string();
        let value = read_field(bytes, &mut cursor)?.to_string();
        labels.push((name, value));
    }

    let help_text = read_field(bytes, &mut cursor)?.to_string();

    Ok(SampleIdentity {
        metric_name,
        sample_name,
        labels,
        help_text,
    })
}

/// 128-bit digest of `data`, stable across process and language versions
/// (XXH3-128: deterministic, not cryptographic, collision-resistant in
/// practice for key-space sizes this store sees).
pub fn stable_hash(data: &[u8]) -> String {
    format!("{:032x}", xxh3_128(data))
}

/// `prefix:type_suffix:pid:kind:hash(encoded_sid)`, per §4.1/§6.
/// `type_suffix` is `metric_type` for non-gauges and
/// `metric_type_aggregation_mode` for gauges, so a gauge's key alone
/// determines its aggregation mode (invariant 4/testable property 7).
pub fn storage_key(
    prefix: &str,
    pid: Pid,
    metric_type: MetricType,
    aggregation_mode: AggregationMode,
    kind: KeyKind,
    encoded_sid: &[u8],
) -> Vec<u8> {
    let type_suffix = if metric_type == MetricType::Gauge {
        format!("{metric_type}_{aggregation_mode}")
    } else {
        metric_type.to_string()
    };

    format!(
        "{prefix}:{type_suffix}:{pid}:{}:{}",
        kind.as_str(),
        stable_hash(encoded_sid)
    )
    .into_bytes()
}

/// Parses the `type_suffix` component of a network-backend key back into
/// `(metric_type, aggregation_mode)`. For non-gauges the aggregation mode
/// must be supplied by the metadata record instead; this recovers the mode
/// embedded for gauges only.
pub fn gauge_mode_from_type_suffix(type_suffix: &str) -> Option<AggregationMode> {
    let (ty, mode) = type_suffix.split_once('_')?;
    if ty != MetricType::Gauge.as_str() {
        return None;
    }
    mode.parse().ok()
}

/// Parses a file back-end's `type_suffix` (the stem before the `_{pid}.db`
/// component of its filename) into `(metric_type, aggregation_mode)`. Plain
/// type names (`counter`, `histogram`, `summary`) always aggregate by sum;
/// gauges encode their mode in the suffix directly.
pub fn parse_type_suffix(type_suffix: &str) -> Option<(MetricType, AggregationMode)> {
    if let Some(mode) = gauge_mode_from_type_suffix(type_suffix) {
        return Some((MetricType::Gauge, mode));
    }
    let metric_type: MetricType = type_suffix.parse().ok()?;
    Some((metric_type, AggregationMode::Sum))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(labels: Vec<(&str, &str)>) -> SampleIdentity {
        SampleIdentity::new(
            "requests_total",
            "requests_total",
            labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            "total requests",
        )
    }

    #[test]
    fn round_trip() {
        let original = sid(vec![("route", "/a"), ("method", "GET")]);
        let encoded = encode_sid(&original);
        let decoded = decode_sid(&encoded).expect("should decode");

        assert_eq!(decoded.metric_name, original.metric_name);
        assert_eq!(decoded.sample_name, original.sample_name);
        assert_eq!(decoded.help_text, original.help_text);
        assert_eq!(decoded.labels, vec![
            ("method".to_string(), "GET".to_string()),
            ("route".to_string(), "/a".to_string()),
        ]);
    }

    #[test]
    fn label_order_independent() {
        let a = sid(vec![("route", "/a"), ("method", "GET")]);
        let b = sid(vec![("method", "GET"), ("route", "/a")]);

        assert_eq!(encode_sid(&a), encode_sid(&b));
    }

    #[test]
    fn different_labels_encode_differently() {
        let a = sid(vec![("route", "/a")]);
        let b = sid(vec![("route", "/b")]);

        assert_ne!(encode_sid(&a), encode_sid(&b));
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        let err = decode_sid(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CoreError::MalformedKey(_)));
    }

    #[test]
    fn gauge_key_encodes_mode_without_metadata() {
        let encoded = encode_sid(&sid(vec![]));
        let key = storage_key(
            "gunicorn_sidecar",
            1001,
            MetricType::Gauge,
            AggregationMode::MostRecent,
            KeyKind::Metric,
            &encoded,
        );
        let key = String::from_utf8(key).expect("ascii key");
        let parts: Vec<&str> = key.split(':').collect();

        assert_eq!(parts[0], "gunicorn_sidecar");
        assert_eq!(parts[1], "gauge_mostrecent");
        assert_eq!(parts[2], "1001");
        assert_eq!(parts[3], "metric");
        assert_eq!(
            gauge_mode_from_type_suffix(parts[1]),
            Some(AggregationMode::MostRecent)
        );
    }

    #[test]
    fn non_gauge_key_has_plain_type_suffix() {
        let encoded = encode_sid(&sid(vec![]));
        let key = storage_key(
            "gunicorn_sidecar",
            1001,
            MetricType::Counter,
            AggregationMode::Sum,
            KeyKind::Metric,
            &encoded,
        );
        let key = String::from_utf8(key).expect("ascii key");
        assert!(key.starts_with("gunicorn_sidecar:counter:1001:metric:"));
    }

    #[test]
    fn stable_hash_is_deterministic() {
        let a = stable_hash(b"hello world");
        let b = stable_hash(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
