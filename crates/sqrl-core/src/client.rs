//! The parsed `client` field: protocol version, command, identity keys,
//! and option flags.

use std::fmt;
use std::str::FromStr;

use crate::codec::Envelope;

/// One of the five commands a SQRL client may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    /// Ask the server which identities (current/previous) it recognizes.
    Query,
    /// Assert and authenticate the client's identity.
    Ident,
    /// Disable the identity on the server.
    Disable,
    /// Re-enable a previously disabled identity.
    Enable,
    /// Remove the identity from the server entirely.
    Remove,
}

impl fmt::Display for ClientCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Query => "query",
            Self::Ident => "ident",
            Self::Disable => "disable",
            Self::Enable => "enable",
            Self::Remove => "remove",
        };
        f.write_str(s)
    }
}

impl FromStr for ClientCommand {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(Self::Query),
            "ident" => Ok(Self::Ident),
            "disable" => Ok(Self::Disable),
            "enable" => Ok(Self::Enable),
            "remove" => Ok(Self::Remove),
            other => Err(UnknownToken(other.to_string())),
        }
    }
}

/// One entry of the `opt` tilde-separated option list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOption {
    /// Only accept SQRL authentication for this identity going forward.
    SqrlOnly,
    /// Disallow side-channel identity changes (e.g. email recovery).
    HardLock,
    /// The client can receive a same-device, one-shot session URL.
    Cps,
    /// Ask the server to return the Server Unlock Key.
    Suk,
}

impl fmt::Display for ClientOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SqrlOnly => "sqrlonly",
            Self::HardLock => "hardlock",
            Self::Cps => "cps",
            Self::Suk => "suk",
        };
        f.write_str(s)
    }
}

impl FromStr for ClientOption {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqrlonly" => Ok(Self::SqrlOnly),
            "hardlock" => Ok(Self::HardLock),
            "cps" => Ok(Self::Cps),
            "suk" => Ok(Self::Suk),
            other => Err(UnknownToken(other.to_string())),
        }
    }
}

/// A token in `cmd` or `opt` that is not one of the values this protocol
/// version authorizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownToken(pub String);

impl fmt::Display for UnknownToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized token {:?}", self.0)
    }
}

/// Reasons the decoded `client` envelope fails well-formedness. These are
/// client-visible (map to TIF 0x40|0x80), never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFieldsError {
    /// `ver`, `cmd`, or `idk` was missing.
    MissingKey(&'static str),
    /// `ver` was present but not `"1"`.
    UnsupportedVersion(String),
    /// `cmd` was not one of the five authorized commands.
    UnknownCommand(UnknownToken),
    /// An `opt` token was not one of the four authorized options.
    UnknownOption(UnknownToken),
}

impl fmt::Display for ClientFieldsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKey(key) => write!(f, "client envelope missing required key {key:?}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version {v:?}"),
            Self::UnknownCommand(t) => write!(f, "unknown command: {t}"),
            Self::UnknownOption(t) => write!(f, "unknown option: {t}"),
        }
    }
}

/// The parsed and validated `client` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFields {
    /// Protocol version; always `"1"` once parsed successfully.
    pub ver: String,
    /// The requested command.
    pub cmd: ClientCommand,
    /// Current identity public key (base64url Ed25519).
    pub idk: String,
    /// Previous identity public key, if the client is rekeying.
    pub pidk: Option<String>,
    /// Server Unlock Key, when the client supplies one.
    pub suk: Option<String>,
    /// Verify Unlock Key, when the client supplies one.
    pub vuk: Option<String>,
    /// Parsed `opt` tokens, in client order.
    pub opt: Vec<ClientOption>,
    /// Client-supplied value echoed back verbatim via the `btn` passthrough
    /// action.
    pub btn: Option<String>,
    /// Client-supplied value echoed back verbatim via the `ins` passthrough
    /// action.
    pub ins: Option<String>,
    /// Client-supplied value echoed back verbatim via the `pins` passthrough
    /// action.
    pub pins: Option<String>,
}

impl ClientFields {
    /// Parses and validates a decoded `client` envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ClientFieldsError`] for any missing required key,
    /// unsupported version, unrecognized command, or unrecognized option
    /// token.
    pub fn parse(envelope: &Envelope) -> Result<Self, ClientFieldsError> {
        let ver = envelope.get("ver").ok_or(ClientFieldsError::MissingKey("ver"))?.to_string();
        if ver != "1" {
            return Err(ClientFieldsError::UnsupportedVersion(ver));
        }

        let cmd_raw = envelope.get("cmd").ok_or(ClientFieldsError::MissingKey("cmd"))?;
        let cmd = ClientCommand::from_str(cmd_raw).map_err(ClientFieldsError::UnknownCommand)?;

        let idk = envelope.get("idk").ok_or(ClientFieldsError::MissingKey("idk"))?.to_string();

        let opt = match envelope.get("opt") {
            Some(raw) => Envelope::split_opt(raw)
                .iter()
                .map(|token| ClientOption::from_str(token).map_err(ClientFieldsError::UnknownOption))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            ver,
            cmd,
            idk,
            pidk: envelope.get("pidk").map(str::to_string),
            suk: envelope.get("suk").map(str::to_string),
            vuk: envelope.get("vuk").map(str::to_string),
            opt,
            btn: envelope.get("btn").map(str::to_string),
            ins: envelope.get("ins").map(str::to_string),
            pins: envelope.get("pins").map(str::to_string),
        })
    }

    /// `true` if `option` was present in the client's `opt` list.
    #[must_use]
    pub fn has_option(&self, option: ClientOption) -> bool {
        self.opt.contains(&option)
    }
}
