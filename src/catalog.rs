//! Command catalog: builds the JSON payload and wire command code for a
//! given logical operation, based on device profile and protocol version.
//!
//! Grounded in `Device::generate_payload`'s field-assembly rules, lifted
//! out into a standalone, independently testable table so the overlay
//! order (default -> version profile -> device-type profile) is explicit
//! rather than buried in a single long match.

use crate::protocol::CommandType;
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Device-type profile layered on top of the version profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// Ordinary device, no special handling.
    Default,
    /// 3.2-wire devices that speak a 3.3-shaped payload with quirks
    /// (dp-query must be sent as control-new with a `null` dps body).
    Device22,
    /// Gateway talking to a sub-device identified by a `cid`/node id.
    /// Carries the id only; no Zigbee cluster routing is implemented.
    Zigbee,
}

/// Inputs needed to build a request payload, independent of any live
/// connection state.
pub struct PayloadRequest<'a> {
    pub command: CommandType,
    pub data: Option<Value>,
    pub device_id: &'a str,
    pub cid: Option<&'a str>,
    pub req_type: Option<&'a str>,
    pub profile: DeviceProfile,
    /// Negotiated protocol version number (e.g. 3.4); `Auto`/unknown is 0.0.
    pub version: f32,
}

const KEY_CID: &str = "cid";
const KEY_DPS: &str = "dps";
const KEY_T: &str = "t";
const KEY_DATA: &str = "data";
const KEY_PROTOCOL: &str = "protocol";
const KEY_CTYPE: &str = "ctype";
const KEY_GW_ID: &str = "gwId";
const KEY_DEV_ID: &str = "devId";
const KEY_UID: &str = "uid";
const KEY_REQ_TYPE: &str = "reqType";

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Resolves the outgoing command code for `request`, applying the
/// catalog's `commandOverride` rules: `control` -> `controlNew` and
/// `dpQuery` -> `dpQueryNew` on v3.4+; `dpQuery` -> `controlNew` on the
/// `device22` profile (which takes priority, since a device22 gateway
/// always wants control-new for a query regardless of version).
pub fn resolve_command(request: &PayloadRequest) -> u32 {
    let mut cmd = request.command as u32;
    if request.version >= 3.4 {
        cmd = match request.command {
            CommandType::Control => CommandType::ControlNew as u32,
            CommandType::DpQuery => CommandType::DpQueryNew as u32,
            _ => cmd,
        };
    }
    if request.profile == DeviceProfile::Device22 && cmd == CommandType::DpQuery as u32 {
        cmd = CommandType::ControlNew as u32;
    }
    cmd
}

/// Builds the outgoing JSON payload for `request`. Returns the resolved
/// command code alongside the payload, since the two are not separable
/// (the nested-`data` shape only applies to the resolved command).
pub fn build_payload(request: &PayloadRequest) -> (u32, Value) {
    let cmd = resolve_command(request);

    // device22's dp-query-as-control-new convention: an empty query is
    // expressed as `{"1": null}` rather than an absent dps body.
    let data = match (request.profile, cmd, request.data.as_ref()) {
        (DeviceProfile::Device22, c, None) if c == CommandType::ControlNew as u32 => {
            Some(serde_json::json!({"1": null}))
        }
        _ => request.data.clone(),
    };

    let mut payload = Map::new();
    if let Some(cid) = request.cid {
        payload.insert(KEY_CID.into(), cid.into());
    }

    // The nested `protocol`/`data.dps` envelope is a v3.4+ wire construct.
    // A device22 gateway resolves dpQuery to ControlNew below v3.4 too
    // (see `resolve_command`), but still expects the flat `gwId`/`devId`/
    // `dps` body there — only a genuine v3.4+ connection gets the nested
    // shape.
    let use_nested = request.version >= 3.4
        && matches!(
            CommandType::from_u32(cmd),
            Some(CommandType::ControlNew | CommandType::LanExtStream)
        );

    if use_nested {
        payload.insert(KEY_PROTOCOL.into(), 5.into());
        payload.insert(KEY_T.into(), now_secs().into());

        let mut data_obj = Map::new();
        if let Some(cid) = request.cid {
            data_obj.insert(KEY_CID.into(), cid.into());
            data_obj.insert(KEY_CTYPE.into(), 0.into());
        }
        if let Some(d) = data {
            if cmd == CommandType::LanExtStream as u32 {
                if let Some(obj) = d.as_object() {
                    data_obj.extend(obj.clone());
                }
            } else {
                data_obj.insert(KEY_DPS.into(), d);
            }
        }
        payload.insert(KEY_DATA.into(), Value::Object(data_obj));
    } else {
        payload.insert(KEY_GW_ID.into(), request.device_id.into());
        payload.insert(
            KEY_DEV_ID.into(),
            request.cid.unwrap_or(request.device_id).into(),
        );
        payload.insert(KEY_UID.into(), request.device_id.into());
        payload.insert(KEY_T.into(), now_secs().to_string().into());
        if let Some(d) = data {
            payload.insert(KEY_DPS.into(), d);
        }
    }

    if let Some(rt) = request.req_type {
        payload.insert(KEY_REQ_TYPE.into(), rt.into());
    }

    (cmd, Value::Object(payload))
}

/// Serializes `payload` with no whitespace between tokens — the device
/// does not reply to requests containing whitespace-separated JSON.
pub fn serialize_compact(payload: &Value) -> Vec<u8> {
    serde_json::to_vec(payload).unwrap_or_default()
}

/// Builds the payload for a data-point refresh request: like a query, but
/// naming the specific indices of interest in `dpId` rather than asking
/// for everything.
pub fn build_update_dps_payload(device_id: &str, indices: &[u32]) -> Value {
    serde_json::json!({
        KEY_GW_ID: device_id,
        KEY_DEV_ID: device_id,
        KEY_UID: device_id,
        KEY_T: now_secs().to_string(),
        "dpId": indices,
    })
}

/// Commands emitted without a version header prepended to their
/// plaintext payload, even on 3.3+.
pub fn skips_version_header(cmd: CommandType) -> bool {
    matches!(
        cmd,
        CommandType::DpQuery
            | CommandType::DpQueryNew
            | CommandType::UpdateDps
            | CommandType::HeartBeat
            | CommandType::SessKeyNegStart
            | CommandType::SessKeyNegResp
            | CommandType::SessKeyNegFinish
            | CommandType::LanExtStream
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req<'a>(
        command: CommandType,
        data: Option<Value>,
        profile: DeviceProfile,
        version: f32,
    ) -> PayloadRequest<'a> {
        PayloadRequest {
            command,
            data,
            device_id: "abc123",
            cid: None,
            req_type: None,
            profile,
            version,
        }
    }

    #[test]
    fn control_overrides_to_control_new_on_v34() {
        let r = req(CommandType::Control, None, DeviceProfile::Default, 3.4);
        assert_eq!(resolve_command(&r), CommandType::ControlNew as u32);
    }

    #[test]
    fn dp_query_stays_plain_below_v34() {
        let r = req(CommandType::DpQuery, None, DeviceProfile::Default, 3.3);
        assert_eq!(resolve_command(&r), CommandType::DpQuery as u32);
    }

    #[test]
    fn device22_forces_dp_query_to_control_new() {
        let r = req(CommandType::DpQuery, None, DeviceProfile::Device22, 3.3);
        assert_eq!(resolve_command(&r), CommandType::ControlNew as u32);
    }

    #[test]
    fn flat_payload_has_gw_dev_uid_fields() {
        let r = req(
            CommandType::Control,
            Some(serde_json::json!({"1": true})),
            DeviceProfile::Default,
            3.3,
        );
        let (_, payload) = build_payload(&r);
        let obj = payload.as_object().unwrap();
        assert_eq!(obj["gwId"], "abc123");
        assert_eq!(obj["devId"], "abc123");
        assert_eq!(obj["uid"], "abc123");
        assert_eq!(obj["dps"], serde_json::json!({"1": true}));
    }

    #[test]
    fn nested_payload_for_control_new_on_v34() {
        let r = req(
            CommandType::Control,
            Some(serde_json::json!({"1": true})),
            DeviceProfile::Default,
            3.4,
        );
        let (cmd, payload) = build_payload(&r);
        assert_eq!(cmd, CommandType::ControlNew as u32);
        let obj = payload.as_object().unwrap();
        assert!(obj.contains_key("data"));
        assert_eq!(obj["data"]["dps"], serde_json::json!({"1": true}));
        assert!(!obj.contains_key("gwId"));
    }

    #[test]
    fn device22_empty_query_sends_null_probe_as_flat_body_below_v34() {
        let r = req(CommandType::DpQuery, None, DeviceProfile::Device22, 3.3);
        let (cmd, payload) = build_payload(&r);
        assert_eq!(cmd, CommandType::ControlNew as u32);
        let obj = payload.as_object().unwrap();
        assert_eq!(obj["gwId"], "abc123");
        assert_eq!(obj["dps"], serde_json::json!({"1": null}));
        assert!(!obj.contains_key("data"));
    }

    #[test]
    fn device22_empty_query_sends_null_probe_as_nested_data_on_v34() {
        let r = req(CommandType::DpQuery, None, DeviceProfile::Device22, 3.4);
        let (cmd, payload) = build_payload(&r);
        assert_eq!(cmd, CommandType::ControlNew as u32);
        assert_eq!(payload["data"]["dps"], serde_json::json!({"1": null}));
    }

    #[test]
    fn serialize_compact_has_no_whitespace() {
        let payload = serde_json::json!({"a": 1, "b": {"c": 2}});
        let bytes = serialize_compact(&payload);
        assert!(!bytes.iter().any(|&b| b == b' ' || b == b'\n'));
    }

    #[test]
    fn zigbee_cid_threaded_into_nested_data() {
        let mut r = req(
            CommandType::Control,
            Some(serde_json::json!({"1": false})),
            DeviceProfile::Zigbee,
            3.4,
        );
        r.cid = Some("node-7");
        let (_, payload) = build_payload(&r);
        assert_eq!(payload["data"]["cid"], "node-7");
        assert_eq!(payload["cid"], "node-7");
    }

    #[test]
    fn update_dps_payload_names_requested_indices() {
        let payload = build_update_dps_payload("abc123", &[1, 2, 101]);
        assert_eq!(payload["gwId"], "abc123");
        assert_eq!(payload["dpId"], serde_json::json!([1, 2, 101]));
    }

    #[test]
    fn heartbeat_skips_version_header() {
        assert!(skips_version_header(CommandType::HeartBeat));
        assert!(!skips_version_header(CommandType::Control));
    }
}
