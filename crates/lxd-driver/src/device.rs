//! Typed profile devices. Serialized in the hypervisor's flat string form:
//! a `type` tag plus dotted keys such as `limits.read`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceSpec {
    Disk(DiskDevice),
    Nic(NicDevice),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDevice {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(
        rename = "limits.read",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub limits_read: Option<String>,
    #[serde(
        rename = "limits.write",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub limits_write: Option<String>,
    #[serde(
        rename = "limits.max",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub limits_max: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "flag")]
    pub optional: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "flag")]
    pub readonly: Option<bool>,
}

impl DiskDevice {
    /// Host directory bind-mounted at `path` inside the container.
    pub fn bind(path: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: Some(source.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicType {
    Bridged,
    P2p,
    Physical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicDevice {
    pub nictype: NicType,
    pub hwaddr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(
        rename = "limits.ingress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub limits_ingress: Option<String>,
    #[serde(
        rename = "limits.egress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub limits_egress: Option<String>,
}

/// Booleans travel as the strings "true"/"false".
mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<bool>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(true) => serializer.serialize_str("true"),
            Some(false) => serializer.serialize_str("false"),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|s| matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disk_serializes_dotted_keys() {
        let disk = DeviceSpec::Disk(DiskDevice {
            path: "/".to_string(),
            size: Some("10GB".to_string()),
            limits_read: Some("13MB".to_string()),
            ..Default::default()
        });
        assert_eq!(
            serde_json::to_value(&disk).unwrap(),
            json!({"type": "disk", "path": "/", "size": "10GB", "limits.read": "13MB"})
        );
    }

    #[test]
    fn test_nic_parses_hypervisor_form() {
        let value = json!({
            "type": "nic",
            "nictype": "bridged",
            "parent": "br0",
            "hwaddr": "fa:16:3e:00:00:01",
            "limits.egress": "1000Mbit"
        });
        let device: DeviceSpec = serde_json::from_value(value).unwrap();
        match device {
            DeviceSpec::Nic(nic) => {
                assert_eq!(nic.nictype, NicType::Bridged);
                assert_eq!(nic.parent.as_deref(), Some("br0"));
                assert_eq!(nic.limits_egress.as_deref(), Some("1000Mbit"));
                assert!(nic.limits_ingress.is_none());
            }
            other => panic!("expected nic, got {other:?}"),
        }
    }

    #[test]
    fn test_readonly_flag_round_trips_as_string() {
        let disk = DeviceSpec::Disk(DiskDevice {
            readonly: Some(true),
            ..DiskDevice::bind("/config-drive", "/srv/configdrive")
        });
        let value = serde_json::to_value(&disk).unwrap();
        assert_eq!(value["readonly"], json!("true"));
        let parsed: DeviceSpec = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, disk);
    }
}
