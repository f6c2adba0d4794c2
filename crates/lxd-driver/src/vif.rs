//! VIF kinds and the NIC device each one maps to.

use lxd_common::Vif;

use crate::device::{DeviceSpec, NicDevice, NicType};
use crate::units::NetworkLimits;
use crate::{DriverError, Result};

/// Linux interface names are limited to 15 bytes plus NUL; the networking
/// service reserves one more for its own suffixes.
const NIC_NAME_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VifKind {
    Bridge,
    Ovs,
    Tap,
    PointToPoint,
}

impl VifKind {
    pub fn parse(vif_type: &str) -> Option<Self> {
        match vif_type {
            "bridge" => Some(VifKind::Bridge),
            "ovs" => Some(VifKind::Ovs),
            "tap" => Some(VifKind::Tap),
            "ptp" | "vrouter" => Some(VifKind::PointToPoint),
            _ => None,
        }
    }
}

/// A VIF with its kind resolved to the host-side attachment point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VifConfig {
    pub kind: VifKind,
    pub mac_address: String,
    pub bridge: Option<String>,
    pub devname: String,
}

pub fn devname(vif: &Vif) -> String {
    match &vif.devname {
        Some(name) => name.clone(),
        None => format!("tap{}", vif.id).chars().take(NIC_NAME_LEN).collect(),
    }
}

fn hybrid_bridge(vif: &Vif) -> String {
    format!("qbr{}", vif.id).chars().take(NIC_NAME_LEN).collect()
}

pub fn resolve(instance_name: &str, vif: &Vif) -> Result<VifConfig> {
    let kind = VifKind::parse(&vif.vif_type).ok_or_else(|| DriverError::UnsupportedDevice {
        name: instance_name.to_string(),
        vif_type: vif.vif_type.clone(),
    })?;

    let bridge = match kind {
        VifKind::Bridge => vif.network.bridge.clone(),
        VifKind::Ovs if vif.details.ovs_hybrid_plug => Some(hybrid_bridge(vif)),
        VifKind::Ovs => vif.network.bridge.clone(),
        VifKind::Tap | VifKind::PointToPoint => None,
    };

    Ok(VifConfig {
        kind,
        mac_address: vif.address.clone(),
        bridge,
        devname: devname(vif),
    })
}

impl VifConfig {
    /// Device key and NIC spec. Bridged NICs are keyed by their bridge,
    /// point-to-point NICs by the host device name.
    pub fn nic_device(&self, limits: &NetworkLimits) -> (String, DeviceSpec) {
        let (key, nic) = match &self.bridge {
            Some(bridge) => (
                bridge.clone(),
                NicDevice {
                    nictype: NicType::Bridged,
                    hwaddr: self.mac_address.clone(),
                    parent: Some(bridge.clone()),
                    host_name: None,
                    limits_ingress: None,
                    limits_egress: None,
                },
            ),
            None => (
                self.devname.clone(),
                NicDevice {
                    nictype: NicType::P2p,
                    hwaddr: self.mac_address.clone(),
                    parent: None,
                    host_name: Some(self.devname.clone()),
                    limits_ingress: None,
                    limits_egress: None,
                },
            ),
        };

        let nic = NicDevice {
            limits_ingress: limits.ingress.clone(),
            limits_egress: limits.egress.clone(),
            ..nic
        };
        (key, DeviceSpec::Nic(nic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lxd_common::{VifDetails, VifNetwork};

    fn vif(vif_type: &str, bridge: Option<&str>) -> Vif {
        Vif {
            id: "0123456789abcdef".to_string(),
            address: "fa:16:3e:00:00:01".to_string(),
            vif_type: vif_type.to_string(),
            network: VifNetwork {
                bridge: bridge.map(str::to_string),
            },
            devname: None,
            details: VifDetails::default(),
        }
    }

    #[test]
    fn test_devname_is_truncated() {
        assert_eq!(devname(&vif("tap", None)), "tap0123456789a");
    }

    #[test]
    fn test_bridge_vif_resolves_to_network_bridge() {
        let cfg = resolve("i-1", &vif("bridge", Some("br100"))).unwrap();
        assert_eq!(cfg.kind, VifKind::Bridge);
        assert_eq!(cfg.bridge.as_deref(), Some("br100"));

        let (key, device) = cfg.nic_device(&NetworkLimits::default());
        assert_eq!(key, "br100");
        match device {
            DeviceSpec::Nic(nic) => {
                assert_eq!(nic.nictype, NicType::Bridged);
                assert_eq!(nic.parent.as_deref(), Some("br100"));
            }
            other => panic!("expected nic, got {other:?}"),
        }
    }

    #[test]
    fn test_hybrid_ovs_uses_linux_bridge() {
        let mut ovs = vif("ovs", Some("br-int"));
        ovs.details.ovs_hybrid_plug = true;
        let cfg = resolve("i-1", &ovs).unwrap();
        assert_eq!(cfg.bridge.as_deref(), Some("qbr0123456789a"));
    }

    #[test]
    fn test_tap_is_point_to_point() {
        let cfg = resolve("i-1", &vif("tap", None)).unwrap();
        let limits = NetworkLimits {
            ingress: Some("1000Mbit".to_string()),
            egress: None,
        };
        let (key, device) = cfg.nic_device(&limits);
        assert_eq!(key, "tap0123456789a");
        match device {
            DeviceSpec::Nic(nic) => {
                assert_eq!(nic.nictype, NicType::P2p);
                assert_eq!(nic.host_name.as_deref(), Some("tap0123456789a"));
                assert_eq!(nic.limits_ingress.as_deref(), Some("1000Mbit"));
            }
            other => panic!("expected nic, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_vif_type_is_unsupported() {
        let err = resolve("i-1", &vif("vhostuser", None)).unwrap_err();
        assert!(matches!(
            err,
            DriverError::UnsupportedDevice { ref vif_type, .. } if vif_type == "vhostuser"
        ));
    }
}
