//! Protocol message types
//!
//! Every application-level message is a JSON object with an integer `type`
//! field drawn from this table. The values are fixed by the wire protocol and
//! must match the backend exactly.

use serde_json::Value;

pub const LOG_MESSAGE: i32 = 10;
pub const STP_NOGROUP: i32 = 27;

pub const ZMQ_SUBSCRIBE: i32 = 150;
pub const ZMQ_UNSUBSCRIBE: i32 = 151;

pub const PING: i32 = 210;
pub const PING_ACKNOWLEDGE: i32 = 215;

pub const HALRCOMP_BIND: i32 = 256;
pub const HALRCOMP_BIND_CONFIRM: i32 = 257;
pub const HALRCOMP_BIND_REJECT: i32 = 258;
pub const HALRCOMP_SET: i32 = 259;
pub const HALRCOMP_SET_REJECT: i32 = 260;
pub const HALRCOMP_ACK: i32 = 263;

pub const HALRCOMMAND_SET: i32 = 265;
pub const HALRCOMMAND_SET_REJECT: i32 = 266;
pub const HALRCOMMAND_GET: i32 = 267;
pub const HALRCOMMAND_GET_REJECT: i32 = 268;
pub const HALRCOMMAND_CREATE: i32 = 269;
pub const HALRCOMMAND_CREATE_REJECT: i32 = 270;
pub const HALRCOMMAND_DELETE: i32 = 271;
pub const HALRCOMMAND_DELETE_REJECT: i32 = 272;
pub const HALRCOMMAND_ACK: i32 = 273;
pub const HALRCOMMAND_ERROR: i32 = 274;
pub const HALRCOMMAND_DESCRIBE: i32 = 276;
pub const HALRCOMMAND_DESCRIPTION: i32 = 277;

pub const HALRCOMP_FULL_UPDATE: i32 = 288;
pub const HALRCOMP_INCREMENTAL_UPDATE: i32 = 289;
pub const HALRCOMP_ERROR: i32 = 290;

pub const HALGROUP_BIND: i32 = 294;
pub const HALGROUP_BIND_CONFIRM: i32 = 295;
pub const HALGROUP_BIND_REJECT: i32 = 296;
pub const HALGROUP_FULL_UPDATE: i32 = 297;
pub const HALGROUP_INCREMENTAL_UPDATE: i32 = 298;
pub const HALGROUP_ERROR: i32 = 299;

/// Extract the integer `type` field used for dispatch
pub fn message_type(msg: &Value) -> Option<i32> {
    msg.get("type").and_then(Value::as_i64).map(|t| t as i32)
}
