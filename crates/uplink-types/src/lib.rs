//! Shared types for the uplink durable telemetry upload pipeline.
//!
//! This crate holds the vocabulary used by the store, the upload worker and
//! the producer adapter. It performs no I/O.
//!
//! # Example
//!
//! ```
//! use uplink_types::{DataKind, UploadStatus};
//!
//! assert_eq!(UploadStatus::try_from(2), Ok(UploadStatus::Uploaded));
//! assert_eq!("events".parse::<DataKind>(), Ok(DataKind::Events));
//! ```

pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{
    Constraints, DataKind, EpochMillis, NetworkKind, Sample, UploadStatus, ValueMap,
};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(UploadStatus::Pending.code(), 0);
        assert_eq!(UploadStatus::Uploading.code(), 1);
        assert_eq!(UploadStatus::Uploaded.code(), 2);
        assert_eq!(UploadStatus::Failed.code(), 3);
    }

    #[test]
    fn test_status_from_invalid_code() {
        assert_eq!(
            UploadStatus::try_from(7),
            Err(ParseError::InvalidStatus(7))
        );
    }

    #[test]
    fn test_nothing_leaves_uploaded() {
        for next in UploadStatus::ALL {
            let allowed = UploadStatus::Uploaded.can_transition_to(next);
            assert_eq!(allowed, next == UploadStatus::Uploaded, "to {next}");
        }
    }

    #[test]
    fn test_sources_of_uploading() {
        let sources = UploadStatus::sources_of(UploadStatus::Uploading);
        assert_eq!(sources, vec![UploadStatus::Pending, UploadStatus::Failed]);
    }

    #[test]
    fn test_sources_of_failed_only_uploading() {
        assert_eq!(
            UploadStatus::sources_of(UploadStatus::Failed),
            vec![UploadStatus::Uploading]
        );
    }

    #[test]
    fn test_data_kind_tags() {
        for kind in DataKind::ALL {
            assert_eq!(kind.as_str().parse::<DataKind>(), Ok(kind));
        }
        assert!("readings".parse::<DataKind>().is_err());
    }

    #[test]
    fn test_network_kind_parse_is_case_insensitive() {
        assert_eq!("WiFi".parse::<NetworkKind>(), Ok(NetworkKind::Wifi));
        assert!(matches!(
            "satellite".parse::<NetworkKind>(),
            Err(ParseError::UnknownNetworkKind(_))
        ));
    }

    #[test]
    fn test_constraints_requires_charging() {
        let c = Constraints {
            wifi_only: false,
            requires_charging: true,
        };
        assert!(!c.is_satisfied_by(NetworkKind::Cellular, false));
        assert!(c.is_satisfied_by(NetworkKind::Cellular, true));
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&UploadStatus::Uploading).unwrap();
        assert_eq!(json, "\"uploading\"");
    }

    proptest! {
        #[test]
        fn prop_status_code_roundtrip(code in 0i64..4) {
            let status = UploadStatus::try_from(code).unwrap();
            prop_assert_eq!(status.code(), code);
        }

        #[test]
        fn prop_no_self_loops_except_uploaded(code in 0i64..4) {
            let status = UploadStatus::try_from(code).unwrap();
            prop_assert_eq!(
                status.can_transition_to(status),
                status == UploadStatus::Uploaded
            );
        }
    }
}
