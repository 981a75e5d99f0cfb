//! Metric error codes.
//!
//! Every metric value loaded into the warehouse is paired with an error code
//! describing why the value is missing or suspect. Codes are bit flags so
//! that problems found by different layers (summarization, mapping, type
//! validation, derived lookups) can be combined into one integer, which is
//! what the `<table>_errors` companion tables store per column.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Deserializer, Serialize};

/// A combination of metric error flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct MetricErrors(u32);

impl MetricErrors {
    pub const OK: Self = Self(0);
    pub const COLLECTION_FAILED: Self = Self(1 << 0);
    pub const NOT_AVAILABLE_ON_HOST: Self = Self(1 << 1);
    pub const DISAPPEARED_DURING_JOB: Self = Self(1 << 2);
    pub const MISSING_UNKNOWN_REASON: Self = Self(1 << 3);
    pub const SUMMARIZATION_ERROR: Self = Self(1 << 4);
    pub const OUT_OF_BOUNDS: Self = Self(1 << 5);
    pub const MAPPING_NOT_FOUND: Self = Self(1 << 6);
    pub const MAPPING_FUNCTION_ERROR: Self = Self(1 << 7);
    pub const AMBIGUOUS: Self = Self(1 << 8);
    pub const DERIVE_QUERY_ERROR: Self = Self(1 << 9);
    pub const TYPE_ERROR: Self = Self(1 << 10);
    pub const COUNTER_ROLLOVER: Self = Self(1 << 11);
    pub const JITTER_ERROR: Self = Self(1 << 12);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Look up a code by its catalog name (`metricTypeError`, ...).
    #[must_use]
    pub fn by_name(name: &str) -> Option<Self> {
        CATALOG
            .iter()
            .find(|code| code.name == name)
            .map(|code| code.value)
    }

    /// Catalog names of every flag set in `self`.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        if self.is_ok() {
            return vec![CATALOG[0].name];
        }
        CATALOG
            .iter()
            .skip(1)
            .filter(|code| self.contains(code.value))
            .map(|code| code.name)
            .collect()
    }
}

impl BitOr for MetricErrors {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MetricErrors {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for MetricErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Codes may be written in configuration either as their integer value or
/// as a catalog name.
impl<'de> Deserialize<'de> for MetricErrors {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bits(u32),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bits(bits) => Ok(Self(bits)),
            Repr::Name(name) => Self::by_name(&name).ok_or_else(|| {
                serde::de::Error::custom(format!("unknown metric error code '{name}'"))
            }),
        }
    }
}

/// One entry of the metric error vocabulary.
#[derive(Debug, Clone, Copy)]
pub struct MetricErrorCode {
    pub name: &'static str,
    pub value: MetricErrors,
    pub description: &'static str,
}

pub const CATALOG: &[MetricErrorCode] = &[
    MetricErrorCode {
        name: "metricOK",
        value: MetricErrors::OK,
        description: "No error",
    },
    MetricErrorCode {
        name: "metricCollectionFailed",
        value: MetricErrors::COLLECTION_FAILED,
        description: "The data collection failed for this metric",
    },
    MetricErrorCode {
        name: "metricNotAvailOnThisHost",
        value: MetricErrors::NOT_AVAILABLE_ON_HOST,
        description: "The metric is not available on this host",
    },
    MetricErrorCode {
        name: "metricDisappearedDuringJob",
        value: MetricErrors::DISAPPEARED_DURING_JOB,
        description: "The metric disappeared during the job",
    },
    MetricErrorCode {
        name: "metricMissingUnknownReason",
        value: MetricErrors::MISSING_UNKNOWN_REASON,
        description: "The metric is missing for an unknown reason",
    },
    MetricErrorCode {
        name: "metricSummarizationError",
        value: MetricErrors::SUMMARIZATION_ERROR,
        description: "The summarization of the metric failed",
    },
    MetricErrorCode {
        name: "metricOutOfBounds",
        value: MetricErrors::OUT_OF_BOUNDS,
        description: "The metric value was outside its valid range",
    },
    MetricErrorCode {
        name: "metricMappingNotFound",
        value: MetricErrors::MAPPING_NOT_FOUND,
        description: "No mapping was found for the metric",
    },
    MetricErrorCode {
        name: "metricMappingFunctionError",
        value: MetricErrors::MAPPING_FUNCTION_ERROR,
        description: "The mapping function for the metric failed",
    },
    MetricErrorCode {
        name: "metricAmbiguous",
        value: MetricErrors::AMBIGUOUS,
        description: "The metric value is ambiguous",
    },
    MetricErrorCode {
        name: "metricDeriveQueryError",
        value: MetricErrors::DERIVE_QUERY_ERROR,
        description: "The query deriving the metric failed or found nothing",
    },
    MetricErrorCode {
        name: "metricTypeError",
        value: MetricErrors::TYPE_ERROR,
        description: "The metric value has the wrong type",
    },
    MetricErrorCode {
        name: "metricCounterRollover",
        value: MetricErrors::COUNTER_ROLLOVER,
        description: "A counter rolled over during collection",
    },
    MetricErrorCode {
        name: "metricJitterError",
        value: MetricErrors::JITTER_ERROR,
        description: "Sampling jitter made the metric unreliable",
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_report_names() {
        let mut e = MetricErrors::MISSING_UNKNOWN_REASON;
        e |= MetricErrors::TYPE_ERROR;
        assert_eq!(e.bits(), 8 | 1024);
        assert!(e.contains(MetricErrors::TYPE_ERROR));
        assert!(!e.contains(MetricErrors::AMBIGUOUS));
        assert_eq!(e.names(), vec!["metricMissingUnknownReason", "metricTypeError"]);
        assert_eq!(MetricErrors::OK.names(), vec!["metricOK"]);
    }

    #[test]
    fn catalog_bits_are_distinct() {
        let mut seen = 0u32;
        for code in CATALOG.iter().skip(1) {
            assert_eq!(code.value.bits().count_ones(), 1, "{}", code.name);
            assert_eq!(seen & code.value.bits(), 0, "{}", code.name);
            seen |= code.value.bits();
        }
    }

    #[test]
    fn deserializes_from_name_or_bits() {
        let by_name: MetricErrors = serde_json::from_str("\"metricAmbiguous\"").unwrap();
        let by_bits: MetricErrors = serde_json::from_str("256").unwrap();
        assert_eq!(by_name, MetricErrors::AMBIGUOUS);
        assert_eq!(by_bits, MetricErrors::AMBIGUOUS);
        assert!(serde_json::from_str::<MetricErrors>("\"metricBogus\"").is_err());
    }
}
