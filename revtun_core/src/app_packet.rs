use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Control-plane message, carried as a JSON object inside one frame.
///
/// The `type` field discriminates the variant on the wire. Receivers skip
/// payloads whose `type` they do not recognize, so new variants can be added
/// without breaking old peers.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlPacket {
    /// Client claims a `(local_port, remote_port)` mapping on the server.
    Register {
        local_port: u16,
        remote_port: u16,
        protocol: String,
        token: String,
        name: String,
    },
    /// First packet of a fresh connection that will serve as a data channel
    /// for an established mapping.
    DataChannel {
        local_port: u16,
        remote_port: u16,
        token: String,
        name: String,
    },
    /// Server's answer to `Register` and `DataChannel`.
    RegisterResp {
        status: RegisterStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Ping {
        time: i64,
    },
    Pong {
        time: i64,
    },
    /// Server asks the client to dial a data channel for `local_port`.
    OpenDataChannel {
        local_port: u16,
    },
    /// Client reports its local service dead; the public listener stops.
    OfflinePort {
        port: u16,
    },
    /// Client reports its local service recovered; the public listener restarts.
    OnlinePort {
        port: u16,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RegisterStatus {
    Ok,
    Fail,
}

impl ControlPacket {
    pub fn register_ok() -> Self {
        ControlPacket::RegisterResp {
            status: RegisterStatus::Ok,
            reason: None,
        }
    }

    pub fn register_fail(reason: &str) -> Self {
        ControlPacket::RegisterResp {
            status: RegisterStatus::Fail,
            reason: Some(reason.to_owned()),
        }
    }
}

/// Current unix time in whole seconds, as carried by `Ping`/`Pong`.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
