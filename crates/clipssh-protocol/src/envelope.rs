use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{PROTOCOL_CLIPSSH, PROTOCOL_GITSSH};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid envelope json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("kind {kind} is not valid for protocol {protocol}")]
    KindMismatch { protocol: String, kind: String },

    #[error("msg_id is not a UUID: {0}")]
    BadMsgId(String),

    #[error("wire text does not carry the expected prefix")]
    MissingPrefix,
}

/// Protocol dialect an envelope belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    #[serde(rename = "CLIPSSH/1")]
    ClipsshV1,
    #[serde(rename = "gitssh/2")]
    GitsshV2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::ClipsshV1 => PROTOCOL_CLIPSSH,
            Protocol::GitsshV2 => PROTOCOL_GITSSH,
        }
    }
}

/// Which peer produced (or should consume) an envelope.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn peer(&self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// Signals a client may forward to the server's PTY foreground group.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalName {
    #[serde(rename = "INT")]
    Int,
    #[serde(rename = "QUIT")]
    Quit,
    #[serde(rename = "TSTP")]
    Tstp,
}

/// Kind-specific message payload.
///
/// Serialized adjacently tagged so the wire object carries `kind` and `body`
/// as sibling keys of the envelope routing fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Body {
    ConnectReq {
        host: String,
    },
    ConnectAck {
        session_id: String,
        user: String,
        host: String,
        cwd: String,
        cols: u16,
        rows: u16,
    },
    Busy {
        session_id: String,
    },
    Cmd {
        text: String,
    },
    Stdout {
        cmd_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Stderr {
        cmd_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Exit {
        cmd_id: String,
        code: i32,
    },
    PtyInput {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    PtyOutput {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    PtyResize {
        cols: u16,
        rows: u16,
    },
    PtySignal {
        name: SignalName,
    },
    PtyClosed {
        exit_status: i32,
    },
    Disconnect {},
    Error {
        code: String,
        message: String,
    },
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::ConnectReq { .. } => "connect_req",
            Body::ConnectAck { .. } => "connect_ack",
            Body::Busy { .. } => "busy",
            Body::Cmd { .. } => "cmd",
            Body::Stdout { .. } => "stdout",
            Body::Stderr { .. } => "stderr",
            Body::Exit { .. } => "exit",
            Body::PtyInput { .. } => "pty_input",
            Body::PtyOutput { .. } => "pty_output",
            Body::PtyResize { .. } => "pty_resize",
            Body::PtySignal { .. } => "pty_signal",
            Body::PtyClosed { .. } => "pty_closed",
            Body::Disconnect {} => "disconnect",
            Body::Error { .. } => "error",
        }
    }

    /// Whether this kind belongs to the given dialect's kind set.
    pub fn valid_for(&self, protocol: Protocol) -> bool {
        match self {
            Body::ConnectReq { .. }
            | Body::ConnectAck { .. }
            | Body::Busy { .. }
            | Body::Disconnect {}
            | Body::Error { .. } => true,
            Body::Cmd { .. } | Body::Stdout { .. } | Body::Stderr { .. } | Body::Exit { .. } => {
                protocol == Protocol::ClipsshV1
            }
            Body::PtyInput { .. }
            | Body::PtyOutput { .. }
            | Body::PtyResize { .. }
            | Body::PtySignal { .. }
            | Body::PtyClosed { .. } => protocol == Protocol::GitsshV2,
        }
    }
}

/// One session-layer message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub protocol: Protocol,
    pub session_id: String,
    pub msg_id: String,
    /// Producer wall clock, milliseconds since the Unix epoch. Informational.
    pub ts: u64,
    pub source: Role,
    pub target: Role,
    pub seq: u64,
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    /// Build an envelope with a fresh msg_id and the current wall clock.
    pub fn new(
        protocol: Protocol,
        session_id: impl Into<String>,
        source: Role,
        seq: u64,
        body: Body,
    ) -> Envelope {
        Envelope {
            protocol,
            session_id: session_id.into(),
            msg_id: Uuid::new_v4().to_string(),
            ts: unix_millis(),
            source,
            target: source.peer(),
            seq,
            body,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate an envelope from its JSON wire form.
    pub fn from_json(text: &str) -> Result<Envelope, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if Uuid::parse_str(&self.msg_id).is_err() {
            return Err(ProtocolError::BadMsgId(self.msg_id.clone()));
        }
        if !self.body.valid_for(self.protocol) {
            return Err(ProtocolError::KindMismatch {
                protocol: self.protocol.as_str().to_string(),
                kind: self.kind().to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Serde adapter for binary fields carried as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
