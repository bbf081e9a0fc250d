// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{anyhow, Result};
use smithay::reexports::drm::control::{
    connector::{self, State as ConnectorState},
    crtc, plane, property, Device as ControlDevice, Mode, ModeFlags, ModeTypeFlags, PlaneType,
    ResourceHandle,
};
use std::time::Duration;

/// The connector, CRTC and mode playback is shown on.
#[derive(Debug, Clone)]
pub struct OutputSelection {
    pub connector: connector::Handle,
    pub crtc: crtc::Handle,
    pub mode: Mode,
    pub name: String,
}

impl OutputSelection {
    pub fn size(&self) -> (u32, u32) {
        let (w, h) = self.mode.size();
        (w as u32, h as u32)
    }

    pub fn refresh_interval(&self) -> Duration {
        refresh_interval(calculate_refresh_rate(self.mode))
    }
}

/// Picks the first connected connector with its preferred mode.
///
/// We expect the previous drm master (likely the login manager) to leave the device
/// in a sensible state, so an established connector to CRTC mapping is kept.
pub fn select_output(device: &impl ControlDevice) -> Result<OutputSelection> {
    let res_handles = device.resource_handles()?;

    for conn in res_handles
        .connectors()
        .iter()
        .flat_map(|conn| device.get_connector(*conn, true).ok())
        .filter(|conn| conn.state() == ConnectorState::Connected)
    {
        let Some(mode) = conn
            .modes()
            .iter()
            .find(|mode| mode.mode_type().contains(ModeTypeFlags::PREFERRED))
            .or_else(|| conn.modes().first())
            .copied()
        else {
            continue;
        };

        let current = conn
            .current_encoder()
            .and_then(|enc| device.get_encoder(enc).ok())
            .and_then(|enc| enc.crtc());
        let crtc = current.or_else(|| {
            conn.encoders()
                .iter()
                .flat_map(|handle| device.get_encoder(*handle))
                .flat_map(|info| res_handles.filter_crtcs(info.possible_crtcs()))
                .next()
        });
        let Some(crtc) = crtc else {
            continue;
        };

        return Ok(OutputSelection {
            connector: conn.handle(),
            crtc,
            mode,
            name: interface_name(device, conn.handle())?,
        });
    }

    anyhow::bail!("No connected display found")
}

/// The primary plane feeding `crtc`, needed for atomic commits.
pub fn primary_plane(device: &impl ControlDevice, crtc: crtc::Handle) -> Result<plane::Handle> {
    let res_handles = device.resource_handles()?;
    for plane in device.plane_handles()? {
        let info = device.get_plane(plane)?;
        if !res_handles
            .filter_crtcs(info.possible_crtcs())
            .contains(&crtc)
        {
            continue;
        }
        let is_primary =
            get_property_val(device, plane, "type").map(|(val_type, val)| {
                match val_type.convert_value(val) {
                    property::Value::Enum(Some(val)) => val.value() == PlaneType::Primary as u64,
                    _ => false,
                }
            })?;
        if is_primary {
            return Ok(plane);
        }
    }
    Err(anyhow!("No primary plane for crtc {:?}", crtc))
}

pub fn interface_name(device: &impl ControlDevice, connector: connector::Handle) -> Result<String> {
    let conn_info = device.get_connector(connector, false)?;

    let other_short_name;
    let interface_short_name = match conn_info.interface() {
        connector::Interface::DVII => "DVI-I",
        connector::Interface::DVID => "DVI-D",
        connector::Interface::DVIA => "DVI-A",
        connector::Interface::SVideo => "S-VIDEO",
        connector::Interface::DisplayPort => "DP",
        connector::Interface::HDMIA => "HDMI-A",
        connector::Interface::HDMIB => "HDMI-B",
        connector::Interface::EmbeddedDisplayPort => "eDP",
        other => {
            other_short_name = format!("{:?}", other);
            &other_short_name
        }
    };

    Ok(format!(
        "{}-{}",
        interface_short_name,
        conn_info.interface_id()
    ))
}

pub fn get_prop(
    device: &impl ControlDevice,
    handle: impl ResourceHandle,
    name: &str,
) -> Result<property::Handle> {
    let props = device.get_properties(handle)?;
    let (prop_handles, _) = props.as_props_and_values();
    for prop in prop_handles {
        let info = device.get_property(*prop)?;
        if Some(name) == info.name().to_str().ok() {
            return Ok(*prop);
        }
    }
    anyhow::bail!("No prop found for {}", name)
}

pub fn get_property_val(
    device: &impl ControlDevice,
    handle: impl ResourceHandle,
    name: &str,
) -> Result<(property::ValueType, property::RawValue)> {
    let props = device.get_properties(handle)?;
    let (prop_handles, values) = props.as_props_and_values();
    for (&prop, &val) in prop_handles.iter().zip(values.iter()) {
        let info = device.get_property(prop)?;
        if Some(name) == info.name().to_str().ok() {
            let val_type = info.value_type();
            return Ok((val_type, val));
        }
    }
    anyhow::bail!("No prop found for {}", name)
}

// Returns refresh rate in millihertz
pub fn calculate_refresh_rate(mode: Mode) -> u32 {
    let htotal = mode.hsync().2 as u32;
    let vtotal = mode.vsync().2 as u32;
    if htotal == 0 || vtotal == 0 {
        return 0;
    }
    let mut refresh =
        (mode.clock() as u64 * 1000000_u64 / htotal as u64 + vtotal as u64 / 2) / vtotal as u64;

    if mode.flags().contains(ModeFlags::INTERLACE) {
        refresh *= 2;
    }
    if mode.flags().contains(ModeFlags::DBLSCAN) {
        refresh /= 2;
    }
    if mode.vscan() > 1 {
        refresh /= mode.vscan() as u64;
    }

    refresh as u32
}

/// Duration of one refresh cycle, assuming 60 Hz for bogus rates.
pub fn refresh_interval(millihertz: u32) -> Duration {
    if millihertz < 1000 {
        return Duration::from_nanos(16_666_667);
    }
    Duration::from_nanos(1_000_000_000_000 / millihertz as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn refresh_interval_from_millihertz() {
        assert_eq!(refresh_interval(60_000), Duration::from_nanos(16_666_666));
        assert_eq!(refresh_interval(144_000), Duration::from_nanos(6_944_444));
        assert_eq!(refresh_interval(0), Duration::from_nanos(16_666_667));
    }
}
