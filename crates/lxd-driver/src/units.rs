//! Quota unit conversion from orchestrator extra specs to hypervisor strings.
//!
//! Every divisor used here is a power of two, so each quotient has a
//! terminating decimal expansion and is rendered exactly.

use std::collections::BTreeMap;
use thiserror::Error;

pub const DISK_READ_BYTES: &str = "quota:disk_read_bytes_sec";
pub const DISK_READ_IOPS: &str = "quota:disk_read_iops_sec";
pub const DISK_WRITE_BYTES: &str = "quota:disk_write_bytes_sec";
pub const DISK_WRITE_IOPS: &str = "quota:disk_write_iops_sec";
pub const DISK_TOTAL_BYTES: &str = "quota:disk_total_bytes_sec";
pub const DISK_TOTAL_IOPS: &str = "quota:disk_total_iops_sec";
pub const VIF_INBOUND_AVERAGE: &str = "quota:vif_inbound_average";
pub const VIF_INBOUND_PEAK: &str = "quota:vif_inbound_peak";
pub const VIF_OUTBOUND_AVERAGE: &str = "quota:vif_outbound_average";
pub const VIF_OUTBOUND_PEAK: &str = "quota:vif_outbound_peak";

/// log2 of one mebibyte.
const MIB_SHIFT: u32 = 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid quota {key}={value}")]
pub struct QuotaError {
    pub key: String,
    pub value: String,
}

/// `numer / 2^shift` as an exact decimal string with no trailing zeros.
fn exact_pow2_ratio(numer: i128, shift: u32) -> String {
    let negative = numer < 0;
    let numer = numer.unsigned_abs();
    let mask = (1u128 << shift) - 1;
    let mut out = format!("{}{}", if negative { "-" } else { "" }, numer >> shift);

    let mut rem = numer & mask;
    if rem != 0 {
        out.push('.');
        while rem != 0 {
            rem *= 10;
            out.push(char::from(b'0' + (rem >> shift) as u8));
            rem &= mask;
        }
    }
    out
}

/// Bytes per second to the hypervisor's `MB` unit (2^20 bytes).
pub fn bytes_to_mb(bytes_per_sec: i64) -> String {
    format!("{}MB", exact_pow2_ratio(bytes_per_sec as i128, MIB_SHIFT))
}

pub fn iops(iops_per_sec: i64) -> String {
    format!("{iops_per_sec}iops")
}

/// KB/s to Mbit/s: `value * 1000 * 8 / 2^20`.
pub fn kbps_to_mbit(kb_per_sec: i64) -> String {
    let bits = kb_per_sec as i128 * 1000 * 8;
    format!("{}Mbit", exact_pow2_ratio(bits, MIB_SHIFT))
}

/// Reads a signed integer quota. Missing and non-positive values are unset.
fn quota(specs: &BTreeMap<String, String>, key: &str) -> Result<Option<i64>, QuotaError> {
    let Some(raw) = specs.get(key) else {
        return Ok(None);
    };
    let value: i64 = raw.trim().parse().map_err(|_| QuotaError {
        key: key.to_string(),
        value: raw.clone(),
    })?;
    Ok((value > 0).then_some(value))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskQuota {
    pub read_bytes_sec: Option<i64>,
    pub read_iops_sec: Option<i64>,
    pub write_bytes_sec: Option<i64>,
    pub write_iops_sec: Option<i64>,
    pub total_bytes_sec: Option<i64>,
    pub total_iops_sec: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskLimits {
    pub read: Option<String>,
    pub write: Option<String>,
    pub max: Option<String>,
}

impl DiskQuota {
    pub fn from_extra_specs(specs: &BTreeMap<String, String>) -> Result<Self, QuotaError> {
        Ok(Self {
            read_bytes_sec: quota(specs, DISK_READ_BYTES)?,
            read_iops_sec: quota(specs, DISK_READ_IOPS)?,
            write_bytes_sec: quota(specs, DISK_WRITE_BYTES)?,
            write_iops_sec: quota(specs, DISK_WRITE_IOPS)?,
            total_bytes_sec: quota(specs, DISK_TOTAL_BYTES)?,
            total_iops_sec: quota(specs, DISK_TOTAL_IOPS)?,
        })
    }

    /// Bytes win over IOPS within a direction; any direction-specific limit
    /// suppresses the aggregate one.
    pub fn limits(&self) -> DiskLimits {
        let pick = |bytes: Option<i64>, ops: Option<i64>| {
            bytes.map(bytes_to_mb).or_else(|| ops.map(iops))
        };

        let read = pick(self.read_bytes_sec, self.read_iops_sec);
        let write = pick(self.write_bytes_sec, self.write_iops_sec);
        let max = if read.is_none() && write.is_none() {
            pick(self.total_bytes_sec, self.total_iops_sec)
        } else {
            None
        };

        DiskLimits { read, write, max }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkQuota {
    pub inbound_average: Option<i64>,
    pub inbound_peak: Option<i64>,
    pub outbound_average: Option<i64>,
    pub outbound_peak: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkLimits {
    pub ingress: Option<String>,
    pub egress: Option<String>,
}

impl NetworkQuota {
    pub fn from_extra_specs(specs: &BTreeMap<String, String>) -> Result<Self, QuotaError> {
        Ok(Self {
            inbound_average: quota(specs, VIF_INBOUND_AVERAGE)?,
            inbound_peak: quota(specs, VIF_INBOUND_PEAK)?,
            outbound_average: quota(specs, VIF_OUTBOUND_AVERAGE)?,
            outbound_peak: quota(specs, VIF_OUTBOUND_PEAK)?,
        })
    }

    /// The hypervisor has no average/burst split, so the larger of average
    /// and peak becomes the limit.
    pub fn limits(&self) -> NetworkLimits {
        let peak = |average: Option<i64>, peak: Option<i64>| {
            let max = average.unwrap_or(0).max(peak.unwrap_or(0));
            (max > 0).then(|| kbps_to_mbit(max))
        };

        NetworkLimits {
            ingress: peak(self.inbound_average, self.inbound_peak),
            egress: peak(self.outbound_average, self.outbound_peak),
        }
    }
}
