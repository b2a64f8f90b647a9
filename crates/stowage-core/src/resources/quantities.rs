use crate::error::{Result, StowageError};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

/// Resource name of memory in Kubernetes resource lists
pub const RESOURCE_MEMORY: &str = "memory";
/// Resource name of ephemeral storage in Kubernetes resource lists
pub const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";
/// Resource name of the pod capacity in Kubernetes resource lists
pub const RESOURCE_PODS: &str = "pods";

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
    ("Pi", 50),
    ("Ei", 60),
];

const DECIMAL_SUFFIXES: [(&str, i32); 7] = [
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Memory and ephemeral storage amounts, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceQuantities {
    /// Memory in bytes
    pub memory_bytes: i64,
    /// Ephemeral storage in bytes
    pub ephemeral_storage_bytes: i64,
}

impl ResourceQuantities {
    /// Parse a Kubernetes quantity (e.g., "128Mi", "1.5Gi", "500M", "100m", "1e3")
    ///
    /// Fractional results are rounded up to the next integer, matching how the
    /// API server reports integer values of quantities.
    pub fn parse_quantity(s: &str) -> Result<i64> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let (negative, digits) = match number.as_bytes().first() {
            Some(b'-') => (true, &number[1..]),
            Some(b'+') => (false, &number[1..]),
            _ => (false, number),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(StowageError::invalid_quantity(s, "missing number"));
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(StowageError::invalid_quantity(s, "malformed number"));
        }
        if int_part.len() + frac_part.len() > 30 {
            return Err(StowageError::invalid_quantity(s, "too many digits"));
        }

        let overflow = || StowageError::invalid_quantity(s, "value out of range");
        let mut numerator: i128 = format!("{}{}", int_part, frac_part)
            .parse::<i128>()
            .map_err(|e| StowageError::invalid_quantity(s, e.to_string()))?;
        let mut denominator: i128 = 10i128.pow(frac_part.len() as u32);

        if let Some((_, shift)) = BINARY_SUFFIXES.iter().find(|(name, _)| *name == suffix) {
            numerator = numerator.checked_mul(1i128 << shift).ok_or_else(overflow)?;
        } else {
            let exponent = if suffix.is_empty() {
                0
            } else if let Some((_, exp)) = DECIMAL_SUFFIXES.iter().find(|(name, _)| *name == suffix) {
                *exp
            } else if let Some(exp) = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))
                .and_then(|e| e.parse::<i32>().ok())
            {
                exp
            } else {
                return Err(StowageError::invalid_quantity(s, "unknown suffix"));
            };

            if exponent.unsigned_abs() > 30 {
                return Err(overflow());
            }
            let scale = 10i128.pow(exponent.unsigned_abs());
            if exponent >= 0 {
                numerator = numerator.checked_mul(scale).ok_or_else(overflow)?;
            } else {
                denominator = denominator.checked_mul(scale).ok_or_else(overflow)?;
            }
        }

        let mut value = numerator / denominator;
        if numerator % denominator != 0 {
            value += 1;
        }
        let value = if negative { -value } else { value };
        i64::try_from(value).map_err(|_| overflow())
    }

    /// Parse memory string (e.g., "128Mi", "1Gi", "1024")
    pub fn parse_memory(s: &str) -> Result<i64> {
        Self::parse_quantity(s)
    }

    /// Look up and parse a single entry of a resource map, 0 if absent or unparsable
    pub fn quantity_from_map(resources: &BTreeMap<String, Quantity>, name: &str) -> i64 {
        resources
            .get(name)
            .and_then(|q| Self::parse_quantity(&q.0).ok())
            .unwrap_or(0)
    }

    /// Get memory and ephemeral storage from a resource map (k8s-openapi format)
    pub fn from_k8s_resource_map(resources: &BTreeMap<String, Quantity>) -> Self {
        Self {
            memory_bytes: Self::quantity_from_map(resources, RESOURCE_MEMORY),
            ephemeral_storage_bytes: Self::quantity_from_map(resources, RESOURCE_EPHEMERAL_STORAGE),
        }
    }

    /// Sum of the requests of all containers of a pod
    pub fn pod_requests(pod: &Pod) -> Self {
        let mut total = Self::default();

        let containers = pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();
        for container in containers {
            if let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) {
                let requested = Self::from_k8s_resource_map(requests);
                total.memory_bytes = total.memory_bytes.saturating_add(requested.memory_bytes);
                total.ephemeral_storage_bytes = total
                    .ephemeral_storage_bytes
                    .saturating_add(requested.ephemeral_storage_bytes);
            }
        }

        total
    }

    /// Render bytes in Kubernetes notation.
    ///
    /// Picks the largest binary suffix that divides the value exactly, so a
    /// request of "6000Mi" renders as "6000Mi" again.
    pub fn format_quantity(bytes: i64) -> String {
        if bytes == 0 {
            return "0".to_string();
        }

        for (suffix, shift) in BINARY_SUFFIXES.iter().rev() {
            let unit = 1i64 << shift;
            if bytes % unit == 0 {
                return format!("{}{}", bytes / unit, suffix);
            }
        }

        format!("{}", bytes)
    }

    /// Bytes as megabytes (10^6), rounded up
    pub fn mega_ceil(bytes: i64) -> i64 {
        const MEGA: i64 = 1_000_000;
        -((-bytes).div_euclid(MEGA))
    }
}
