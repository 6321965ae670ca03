//! Conversion of native backend output into canonical [`DeviceEvent`]s.
//!
//! Each backend gets one free function. The poll backend's normalization is
//! itself a diff against the serial list the caller tracks for that backend.

use std::collections::{HashMap, HashSet};

use crate::device::{ConnectionKind, DeviceKind};
use crate::events::{DeviceEvent, DeviceEventKind};
use crate::protocol::Reply;

/// Compare `instant` with `previous` and replace `previous` with it.
///
/// Additions come first, in `instant` order, then removals in `previous`
/// order. Duplicates within `instant` count once.
pub fn diff_serials(
    previous: &mut Vec<String>,
    instant: &[String],
) -> Vec<(String, DeviceEventKind)> {
    let before: HashSet<&str> = previous.iter().map(String::as_str).collect();
    let mut now: Vec<String> = Vec::with_capacity(instant.len());
    let mut seen = HashSet::new();
    for serial in instant {
        if seen.insert(serial.as_str()) {
            now.push(serial.clone());
        }
    }

    let mut changes: Vec<(String, DeviceEventKind)> = now
        .iter()
        .filter(|s| !before.contains(s.as_str()))
        .map(|s| (s.clone(), DeviceEventKind::Added))
        .collect();
    changes.extend(
        previous
            .iter()
            .filter(|s| !seen.contains(s.as_str()))
            .map(|s| (s.clone(), DeviceEventKind::Removed)),
    );

    *previous = now;
    changes
}

/// Events for one poll tick of a backend discovering `kind` devices.
pub fn poll_events(
    kind: DeviceKind,
    previous: &mut Vec<String>,
    instant: &[String],
) -> Vec<DeviceEvent> {
    diff_serials(previous, instant)
        .into_iter()
        .map(|(serial, event)| DeviceEvent::new(serial, kind, event, ConnectionKind::Usbmuxd))
        .collect()
}

/// Event for one usbmuxd message.
///
/// usbmuxd names a device by serial only when it attaches; later messages
/// carry just its numeric id. `registry` maps ids to serials across calls.
/// Messages for ids never seen attached produce nothing.
pub fn usbmux_event(reply: &Reply, registry: &mut HashMap<u32, String>) -> Option<DeviceEvent> {
    let (udid, kind) = match reply {
        Reply::DeviceAdd(record) => {
            registry.insert(record.device_id, record.serial.clone());
            (record.serial.clone(), DeviceEventKind::Added)
        }
        Reply::DeviceRemove(id) => (registry.remove(id)?, DeviceEventKind::Removed),
        Reply::DevicePaired(id) => (registry.get(id)?.clone(), DeviceEventKind::Paired),
        Reply::Result(_) => return None,
    };
    Some(DeviceEvent::new(
        udid,
        DeviceKind::Ios,
        kind,
        ConnectionKind::Usbmuxd,
    ))
}
