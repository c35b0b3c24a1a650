use super::remote_write_models::WriteRequest;
use crate::datamodel::{LabelSet, Sample};
use crate::ingest::IncomingSeries;
use anyhow::Result;
use prost::Message;
use snap::raw::Decoder;
use std::io::Cursor;

fn decompress_snappy(input: &[u8]) -> Result<Vec<u8>> {
    // The remote write protocol uses the snappy block format, not the
    // framed format.
    Ok(Decoder::new().decompress_vec(input)?)
}

fn parse_protobuf(input: &[u8]) -> Result<WriteRequest> {
    Ok(WriteRequest::decode(&mut Cursor::new(input))?)
}

pub fn parse_remote_write_request(input: &[u8]) -> Result<WriteRequest> {
    let decompressed = decompress_snappy(input)?;
    parse_protobuf(&decompressed)
}

/// Convert a decoded write request into the dispatcher's input form.
pub fn to_incoming_series(request: WriteRequest) -> Vec<IncomingSeries> {
    request
        .timeseries
        .into_iter()
        .map(|series| IncomingSeries {
            labels: LabelSet::from_pairs(
                series
                    .labels
                    .into_iter()
                    .map(|label| (label.name, label.value)),
            ),
            samples: series
                .samples
                .into_iter()
                .map(|sample| Sample {
                    timestamp_ms: sample.timestamp,
                    value: sample.value,
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::METRIC_NAME_LABEL;
    use crate::parsing::remote_write_models::{Label, TimeSeries};

    fn sample_request() -> WriteRequest {
        WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![
                    Label {
                        name: METRIC_NAME_LABEL.to_string(),
                        value: "cpu_seconds_total".to_string(),
                    },
                    Label {
                        name: "instance".to_string(),
                        value: "localhost:9090".to_string(),
                    },
                ],
                samples: vec![super::super::remote_write_models::Sample {
                    value: 0.5,
                    timestamp: 1_700_000_000_000,
                }],
            }],
        }
    }

    #[test]
    fn test_round_trip_through_wire_format() {
        let request = sample_request();
        let mut proto = Vec::new();
        request.encode(&mut proto).unwrap();
        let compressed = snap::raw::Encoder::new().compress_vec(&proto).unwrap();

        let parsed = parse_remote_write_request(&compressed).unwrap();
        assert_eq!(parsed.timeseries.len(), 1);
        assert_eq!(parsed.timeseries[0].samples[0].timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_rejects_uncompressed_payload() {
        let request = sample_request();
        let mut proto = Vec::new();
        request.encode(&mut proto).unwrap();
        assert!(parse_remote_write_request(&proto).is_err());
    }

    #[test]
    fn test_to_incoming_series() {
        let incoming = to_incoming_series(sample_request());
        assert_eq!(incoming.len(), 1);
        assert_eq!(
            incoming[0].labels.metric_name(),
            Some("cpu_seconds_total")
        );
        assert_eq!(incoming[0].samples[0].value, 0.5);
    }
}
