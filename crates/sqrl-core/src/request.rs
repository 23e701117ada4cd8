//! The bounded request state machine: well-formedness and validity checks,
//! command dispatch, and the action dialogue the host resolves one round
//! at a time.
//!
//! A single [`Request::handle`] call may resolve a previously queued batch
//! of actions, re-enter `VALID`, and dispatch a fresh batch, all without
//! returning control to the host — a `confirm` action answered
//! affirmatively, for instance, falls straight back into the dispatch that
//! produced the original command's actions. The loop this drives is capped
//! at [`MAX_ITERATIONS`]; exceeding it means the host is driving the
//! machine incorrectly, not that the protocol itself is stuck.

use std::mem;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tracing::{trace, warn};

use crate::client::{ClientCommand, ClientFields, ClientOption};
use crate::codec::{Envelope, b64u_encode};
use crate::error::RequestError;
use crate::mac::siphash_b64u;
use crate::nut::{Nut, generate_random};
use crate::query::{addquery, stripurl};
use crate::response::{
    Response, TIF_CLIENT_FAILURE, TIF_COMMAND_FAILED, TIF_FUNCTION_NOT_SUPPORTED, TIF_IDS_MATCH,
    TIF_IP_MATCHED, TIF_PIDS_MATCH, TIF_SQRL_DISABLED, TIF_TRANSIENT_ERROR,
};
use crate::server_data::ServerData;

/// Upper bound on how many automatic `NEW -> WELLFORMED -> VALID ->
/// dispatch` transitions one [`Request::handle`] call may drive before an
/// `ACTION` or `COMPLETE` state is reached.
const MAX_ITERATIONS: u32 = 5;

/// Where a request sits in the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Freshly constructed; nothing validated yet.
    New,
    /// `client`/`server`/`nut` decoded and structurally sound.
    WellFormed,
    /// Signatures, MAC, and nut all checked out.
    Valid,
    /// Waiting on the host to resolve one or more queued actions.
    Action,
    /// Terminal; the response is ready to send.
    Complete,
}

/// One of the three ways a freshness/consistency check on the submitted
/// nut can fail, surfaced together in a single [`Action::Confirm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmFlag {
    /// The nut's embedded client address did not match this request's.
    Ip,
    /// The nut was outside its freshness window.
    Time,
    /// The nut's counter fell outside the configured bounds.
    Counter,
}

/// A unit of work the host must resolve before the request can proceed.
///
/// Every round of [`Request::handle`] may enqueue several of these; they
/// are all answered together, via one [`Answer`], on the following call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// The nut failed one or more freshness/consistency checks; the host
    /// decides whether to proceed anyway.
    Confirm {
        /// Which checks failed.
        errors: Vec<ConfirmFlag>,
    },
    /// `query`: look up these identity keys.
    Find {
        /// `idk`, and `pidk` when the client supplied one.
        keys: Vec<String>,
    },
    /// `ident`: authenticate this identity.
    Auth {
        /// The identity key being authenticated.
        idk: String,
        /// Server Unlock Key the client declared, if any.
        client_suk: Option<String>,
        /// Verify Unlock Key the client declared, if any.
        client_vuk: Option<String>,
        /// The client requested same-device session continuation.
        cps: bool,
    },
    /// `disable`: deactivate this identity.
    Disable {
        /// The identity key to disable.
        idk: String,
    },
    /// `enable`, already VUK-authenticated this round: re-activate this
    /// identity.
    Enable {
        /// The identity key to enable.
        idk: String,
    },
    /// `remove`, already VUK-authenticated this round: delete this
    /// identity.
    Remove {
        /// The identity key to remove.
        idk: String,
    },
    /// The client requested (or declined) `sqrlonly`. Resolved only when
    /// the host explicitly rejects support for the function.
    SqrlOnly {
        /// Whether the client's `opt` list asked for it.
        requested: bool,
    },
    /// The client requested (or declined) `hardlock`. Resolved only when
    /// the host explicitly rejects support for the function.
    HardLock {
        /// Whether the client's `opt` list asked for it.
        requested: bool,
    },
    /// The client asked for its Server Unlock Key to be returned.
    Suk,
    /// `enable`/`remove` without prior admin authentication: the host must
    /// supply the account's Verify Unlock Key (or `None` if there isn't
    /// one on file) so the client's `urs` signature can be checked.
    Vuk,
    /// The client's `client` field carried a `btn` value; no response is
    /// required, it is surfaced purely for the host to record.
    Btn {
        /// The raw value.
        value: String,
    },
    /// As [`Action::Btn`], for `ins`.
    Ins {
        /// The raw value.
        value: String,
    },
    /// As [`Action::Btn`], for `pins`.
    Pins {
        /// The raw value.
        value: String,
    },
}

/// One button of an [`Answer::ask`] prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskButton {
    /// The button's label.
    pub label: String,
    /// The URL to follow if this button is chosen, when different from
    /// the request's own `qry`.
    pub url: Option<String>,
}

/// A host-initiated out-of-band prompt, delivered via the `ask` response
/// parameter. Presenting one always completes the request with
/// `TIF_COMMAND_FAILED` set — the client must re-submit with the user's
/// choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskRequest {
    /// The prompt text.
    pub msg: String,
    /// Up to two buttons the client should offer.
    pub buttons: Vec<AskButton>,
}

/// The host's resolution of every action queued by the previous
/// [`Request::handle`] call, plus any side-channel parameters to attach to
/// the response regardless of what was queued.
///
/// Exactly one `Answer` is supplied per call; fields irrelevant to the
/// actions actually pending are simply left at their defaults.
#[derive(Debug, Clone, Default)]
pub struct Answer {
    /// Resolves [`Action::Confirm`].
    pub confirmed: Option<bool>,
    /// Resolves [`Action::Find`]: one boolean per queried key, in order.
    pub find_found: Option<Vec<bool>>,
    /// Set alongside `find_found` when the current identity was found and
    /// is disabled.
    pub find_disabled: bool,
    /// The Server Unlock Key to report when `find_disabled` is set.
    pub find_suk: Option<String>,
    /// Resolves [`Action::Auth`].
    pub authenticated: Option<bool>,
    /// A same-device continuation URL, when `authenticated` and the
    /// client requested `cps`.
    pub auth_url: Option<String>,
    /// Set when authentication failed because the identity is disabled.
    pub auth_disabled: bool,
    /// The Server Unlock Key to report when `auth_disabled` is set.
    pub auth_suk: Option<String>,
    /// Resolves [`Action::Disable`].
    pub deactivated: Option<bool>,
    /// The Server Unlock Key to report once deactivated.
    pub disable_suk: Option<String>,
    /// Set when the identity was found but not deactivated.
    pub disable_found: bool,
    /// Resolves [`Action::Enable`].
    pub activated: Option<bool>,
    /// Set when the identity was found but not activated.
    pub enable_found: bool,
    /// Resolves [`Action::Remove`].
    pub removed: Option<bool>,
    /// Set when the identity was found but not removed.
    pub remove_found: bool,
    /// Resolves [`Action::SqrlOnly`]. `Some(false)` rejects the function;
    /// anything else silently accepts it.
    pub sqrlonly: Option<bool>,
    /// Resolves [`Action::HardLock`]. `Some(false)` rejects the function;
    /// anything else silently accepts it.
    pub hardlock: Option<bool>,
    /// Resolves [`Action::Suk`].
    pub suk: Option<String>,
    /// Resolves [`Action::Vuk`]. The outer `None` means the host did not
    /// address the pending action at all (fatal); `Some(None)` means no
    /// VUK is on file for this account (client-visible failure);
    /// `Some(Some(key))` supplies the key to verify `urs` against.
    pub vuk: Option<Option<String>>,
    /// Side channel: echoed back verbatim as the `sin` response parameter.
    pub sin: Option<String>,
    /// Side channel: a URL reported (with scheme/host stripped) as the
    /// `can` response parameter.
    pub can: Option<String>,
    /// Side channel: presents an out-of-band prompt and completes the
    /// request with `TIF_COMMAND_FAILED`.
    pub ask: Option<AskRequest>,
}

/// What [`Request::handle`] produced this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The host must resolve these actions and call `handle` again.
    Action(Vec<Action>),
    /// The request is finished; call [`Request::finalize`] to get the
    /// response.
    Complete,
}

fn verify_signature(tosign: &str, pubkey_b64: &str, sig_b64: &str) -> bool {
    let Ok(pubkey_bytes) = crate::codec::b64u_decode(pubkey_b64) else { return false };
    let Ok(pubkey_arr): Result<[u8; 32], _> = pubkey_bytes.try_into() else { return false };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pubkey_arr) else { return false };
    let Ok(sig_bytes) = crate::codec::b64u_decode(sig_b64) else { return false };
    let Ok(sig_arr): Result<[u8; 64], _> = sig_bytes.try_into() else { return false };
    let signature = Signature::from_bytes(&sig_arr);
    verifying_key.verify(tosign.as_bytes(), &signature).is_ok()
}

/// Arguments to [`Request::finalize`].
#[derive(Debug, Clone, Default)]
pub struct FinalizeArgs {
    /// The counter to stamp into a freshly generated nut. Required unless
    /// `nut` is supplied.
    pub counter: Option<u32>,
    /// The client address to stamp into a freshly generated nut; defaults
    /// to the request's own address.
    pub ipaddr: Option<String>,
    /// A pre-generated nut string to use as-is, bypassing generation.
    pub nut: Option<String>,
    /// The query path/string the next nut's URL resolves against;
    /// defaults to the prior `server` field's `qry`.
    pub qry: Option<String>,
    /// The timestamp to stamp into a freshly generated nut; defaults to
    /// the current time.
    pub timestamp: Option<u32>,
}

/// A single SQRL authentication exchange: stateless apart from the
/// in-memory fields set up at construction and mutated across `handle`
/// calls.
pub struct Request<'a> {
    master_key: &'a [u8; 32],
    params: Envelope,
    ipaddr: String,
    ttl: u32,
    maxcounter: Option<u32>,
    mincounter: Option<u32>,
    hmac_expected: Option<String>,
    state: State,
    pending: Vec<Action>,
    admin: bool,
    response: Response,
    tosign: String,
    origserver: String,
    client: Option<ClientFields>,
    server: Option<ServerData>,
    passthrough_enqueued: bool,
    clock: Option<u32>,
}

impl<'a> Request<'a> {
    /// Builds a new request from the raw wire parameters a host extracts
    /// from the client's POST body (`nut`, `client`, `server`, `ids`, and
    /// optionally `pids`/`urs`).
    #[must_use]
    pub fn new(
        master_key: &'a [u8; 32],
        params: Envelope,
        ipaddr: impl Into<String>,
        ttl: u32,
        maxcounter: Option<u32>,
        mincounter: Option<u32>,
        hmac_expected: Option<String>,
    ) -> Self {
        Self {
            master_key,
            params,
            ipaddr: ipaddr.into(),
            ttl,
            maxcounter,
            mincounter,
            hmac_expected,
            state: State::New,
            pending: Vec::new(),
            admin: false,
            response: Response::new(),
            tosign: String::new(),
            origserver: String::new(),
            client: None,
            server: None,
            passthrough_enqueued: false,
            clock: None,
        }
    }

    /// The request's current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Pins "now" for the nut freshness check in [`Self::check_valid`],
    /// bypassing the OS clock (see [`crate::nut::Nut::validate_at`]).
    /// Intended for deterministic tests; production hosts should leave this
    /// unset and let the nut codec read the system clock.
    pub fn set_clock(&mut self, now: u32) {
        self.clock = Some(now);
    }

    /// Drives the state machine forward using `answer` to resolve any
    /// actions queued by the previous call, then runs well-formedness,
    /// validity, and dispatch automatically until the machine reaches
    /// `ACTION` or `COMPLETE`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when the host violates the documented
    /// action contract (an answer missing a required field), or when the
    /// iteration bound is exceeded.
    pub fn handle(&mut self, answer: Answer) -> Result<StepOutcome, RequestError> {
        if !self.pending.is_empty() {
            self.resolve_actions(&answer)?;
        }
        self.apply_side_channels(&answer)?;

        let mut iterations = 0u32;
        while !matches!(self.state, State::Action | State::Complete) {
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                return Err(RequestError::IterationBoundExceeded);
            }
            match self.state {
                State::New => self.check_well_formed(),
                State::WellFormed => self.check_valid()?,
                State::Valid => self.dispatch(),
                State::Action | State::Complete => {
                    unreachable!("loop guard excludes Action and Complete")
                }
            }
        }

        // `self.client` is only ever populated partway through the loop above
        // (by `check_well_formed`), so this is the earliest point at which
        // passthrough fields can be queued. It runs even when the command
        // itself already reached `COMPLETE`, in which case the freshly
        // queued actions are surfaced below instead of being discarded.
        self.enqueue_passthrough();

        trace!(state = ?self.state, "handle reached a stopping state");
        if !self.pending.is_empty() {
            return Ok(StepOutcome::Action(self.pending.clone()));
        }
        match self.state {
            State::Complete => Ok(StepOutcome::Complete),
            State::Action => unreachable!("ACTION always carries at least one pending action"),
            State::New | State::WellFormed | State::Valid => {
                unreachable!("loop only exits once Action or Complete is reached")
            }
        }
    }

    fn fail_malformed(&mut self) {
        self.response.tif_on(TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE);
        self.state = State::Complete;
    }

    fn check_well_formed(&mut self) {
        let (Some(_nut), Some(client_raw), Some(server_raw), Some(_ids)) = (
            self.params.get("nut"),
            self.params.get("client"),
            self.params.get("server"),
            self.params.get("ids"),
        ) else {
            warn!("request missing one or more required wire parameters");
            self.fail_malformed();
            return;
        };

        self.origserver = server_raw.to_string();
        self.tosign = format!("{client_raw}{server_raw}");

        let client_envelope = match Envelope::from_base64(client_raw) {
            Ok(e) => e,
            Err(_) => {
                warn!("client field failed to decode");
                self.fail_malformed();
                return;
            }
        };
        let client_fields = match ClientFields::parse(&client_envelope) {
            Ok(f) => f,
            Err(_) => {
                warn!("client field failed to parse");
                self.fail_malformed();
                return;
            }
        };
        let server_data = match ServerData::from_base64(server_raw) {
            Ok(s) => s,
            Err(_) => {
                warn!("server field failed to parse");
                self.fail_malformed();
                return;
            }
        };

        self.client = Some(client_fields);
        self.server = Some(server_data);
        self.state = State::WellFormed;
    }

    fn check_valid(&mut self) -> Result<(), RequestError> {
        let Some(client) = self.client.clone() else {
            self.fail_malformed();
            return Ok(());
        };

        let mut sig_ok = verify_signature(&self.tosign, &client.idk, self.params.get("ids").unwrap_or(""));
        if sig_ok {
            if let (Some(pidk), Some(pids)) = (&client.pidk, self.params.get("pids")) {
                sig_ok = verify_signature(&self.tosign, pidk, pids);
            }
        }
        if !sig_ok {
            warn!("identity signature verification failed");
            self.response.tif_on(TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE);
            self.state = State::Complete;
            return Ok(());
        }

        if let Some(expected) = &self.hmac_expected {
            let computed = siphash_b64u(&self.master_key[..16], self.origserver.as_bytes());
            if &computed != expected {
                warn!("server-field MAC mismatch");
                self.response.tif_on(TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE);
                self.state = State::Complete;
                return Ok(());
            }
        }

        let nut_raw = self.params.get("nut").unwrap_or("");
        let mut nut = match Nut::load(nut_raw, self.master_key) {
            Ok(n) => n,
            Err(_) => {
                warn!("nut failed authenticated decryption");
                self.response.tif_on(TIF_TRANSIENT_ERROR | TIF_COMMAND_FAILED);
                self.state = State::Complete;
                return Ok(());
            }
        };
        match self.clock {
            Some(now) => nut.validate_at(
                &self.ipaddr,
                self.master_key,
                self.ttl,
                self.maxcounter,
                self.mincounter,
                now,
            )?,
            None => {
                nut.validate(&self.ipaddr, self.master_key, self.ttl, self.maxcounter, self.mincounter)?;
            }
        }

        let mut errors = Vec::new();
        if nut.ipmatch {
            self.response.tif_on(TIF_IP_MATCHED);
        } else {
            errors.push(ConfirmFlag::Ip);
        }
        if !nut.fresh {
            errors.push(ConfirmFlag::Time);
        }
        if !nut.countersane {
            errors.push(ConfirmFlag::Counter);
        }

        if errors.is_empty() {
            self.state = State::Valid;
        } else {
            self.pending.push(Action::Confirm { errors });
            self.state = State::Action;
        }
        Ok(())
    }

    fn push_option_actions(&mut self, client: &ClientFields) {
        self.pending.push(Action::SqrlOnly { requested: client.has_option(ClientOption::SqrlOnly) });
        self.pending.push(Action::HardLock { requested: client.has_option(ClientOption::HardLock) });
        if client.has_option(ClientOption::Suk) {
            self.pending.push(Action::Suk);
        }
    }

    fn dispatch(&mut self) {
        let Some(client) = self.client.clone() else {
            self.fail_malformed();
            return;
        };

        match client.cmd {
            ClientCommand::Query => {
                let mut keys = vec![client.idk.clone()];
                if let Some(pidk) = &client.pidk {
                    keys.push(pidk.clone());
                }
                self.pending.push(Action::Find { keys });
            }
            ClientCommand::Ident => {
                self.pending.push(Action::Auth {
                    idk: client.idk.clone(),
                    client_suk: client.suk.clone(),
                    client_vuk: client.vuk.clone(),
                    cps: client.has_option(ClientOption::Cps),
                });
                self.push_option_actions(&client);
            }
            ClientCommand::Disable => {
                self.pending.push(Action::Disable { idk: client.idk.clone() });
                self.push_option_actions(&client);
            }
            ClientCommand::Enable => {
                if self.admin {
                    self.pending.push(Action::Enable { idk: client.idk.clone() });
                    self.push_option_actions(&client);
                } else {
                    self.pending.push(Action::Vuk);
                }
            }
            ClientCommand::Remove => {
                if self.admin {
                    self.pending.push(Action::Remove { idk: client.idk.clone() });
                } else {
                    self.pending.push(Action::Vuk);
                }
            }
        }
        self.state = State::Action;
    }

    fn enqueue_passthrough(&mut self) {
        if self.passthrough_enqueued {
            return;
        }
        let Some(client) = self.client.clone() else { return };
        self.passthrough_enqueued = true;
        if let Some(value) = client.btn {
            self.pending.push(Action::Btn { value });
        }
        if let Some(value) = client.ins {
            self.pending.push(Action::Ins { value });
        }
        if let Some(value) = client.pins {
            self.pending.push(Action::Pins { value });
        }
    }

    fn apply_side_channels(&mut self, answer: &Answer) -> Result<(), RequestError> {
        if let Some(sin) = &answer.sin {
            self.response.add_param("sin", sin.clone());
        }
        if let Some(can) = &answer.can {
            self.response.add_param("can", stripurl(can));
        }
        if let Some(ask) = &answer.ask {
            if ask.msg.is_empty() {
                return Err(RequestError::AskMissingMessage);
            }
            let mut line = b64u_encode(ask.msg.as_bytes());
            for button in &ask.buttons {
                if button.label.contains(';') {
                    return Err(RequestError::AskLabelHasSemicolon);
                }
                let mut part = b64u_encode(button.label.as_bytes());
                if let Some(url) = &button.url {
                    part.push(';');
                    part.push_str(&stripurl(url));
                }
                line.push('~');
                line.push_str(&part);
            }
            self.response.add_param("ask", line);
            self.response.tif_on(TIF_COMMAND_FAILED);
            self.state = State::Complete;
        }
        Ok(())
    }

    fn resolve_actions(&mut self, answer: &Answer) -> Result<(), RequestError> {
        let actions = mem::take(&mut self.pending);
        for action in actions {
            self.resolve_one(action, answer)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn resolve_one(&mut self, action: Action, answer: &Answer) -> Result<(), RequestError> {
        match action {
            Action::Confirm { .. } => {
                if answer.confirmed == Some(true) {
                    self.state = State::Valid;
                } else {
                    self.response.tif_on(TIF_TRANSIENT_ERROR | TIF_COMMAND_FAILED);
                    self.state = State::Complete;
                }
            }
            Action::Find { .. } => {
                let found = answer.find_found.clone().unwrap_or_default();
                if found.is_empty() {
                    return Err(RequestError::FindMissingFound);
                }
                if found.first().copied().unwrap_or(false) {
                    self.response.tif_on(TIF_IDS_MATCH);
                    if answer.find_disabled {
                        self.response.tif_on(TIF_SQRL_DISABLED);
                        let suk = answer.find_suk.clone().ok_or(RequestError::MissingSuk)?;
                        self.response.add_param("suk", suk);
                    }
                }
                if found.get(1).copied().unwrap_or(false) {
                    self.response.tif_on(TIF_PIDS_MATCH);
                }
                self.state = State::Complete;
            }
            Action::Auth { .. } => {
                let authenticated = answer.authenticated.ok_or(RequestError::AuthMissingAuthenticated)?;
                if authenticated {
                    self.response.tif_on(TIF_IDS_MATCH);
                    if let Some(url) = &answer.auth_url {
                        self.response.add_param("url", url.clone());
                    }
                } else if answer.auth_disabled {
                    self.response.tif_on(TIF_IDS_MATCH | TIF_SQRL_DISABLED | TIF_COMMAND_FAILED);
                    let suk = answer.auth_suk.clone().ok_or(RequestError::MissingSuk)?;
                    self.response.add_param("suk", suk);
                } else {
                    self.response.tif_on(TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE);
                }
                self.state = State::Complete;
            }
            Action::Disable { .. } => {
                let deactivated = answer.deactivated.ok_or(RequestError::DisableMissingDeactivated)?;
                if deactivated {
                    let suk = answer.disable_suk.clone().ok_or(RequestError::MissingSuk)?;
                    self.response.add_param("suk", suk);
                    self.response.tif_on(TIF_IDS_MATCH | TIF_SQRL_DISABLED);
                } else {
                    if answer.disable_found {
                        self.response.tif_on(TIF_IDS_MATCH);
                    }
                    self.response.tif_on(TIF_COMMAND_FAILED);
                }
                self.state = State::Complete;
            }
            Action::Enable { .. } => {
                let activated = answer.activated.ok_or(RequestError::EnableMissingActivated)?;
                if activated {
                    self.response.tif_on(TIF_IDS_MATCH);
                } else {
                    if answer.enable_found {
                        self.response.tif_on(TIF_IDS_MATCH);
                    }
                    self.response.tif_on(TIF_COMMAND_FAILED);
                }
                self.state = State::Complete;
            }
            Action::Remove { .. } => {
                let removed = answer.removed.ok_or(RequestError::RemoveMissingRemoved)?;
                if removed {
                    self.response.tif_off(TIF_IDS_MATCH);
                } else {
                    if answer.remove_found {
                        self.response.tif_on(TIF_IDS_MATCH);
                    }
                    self.response.tif_on(TIF_COMMAND_FAILED);
                }
                self.state = State::Complete;
            }
            Action::SqrlOnly { .. } => {
                if answer.sqrlonly == Some(false) {
                    self.response.tif_on(TIF_FUNCTION_NOT_SUPPORTED | TIF_COMMAND_FAILED);
                    self.state = State::Complete;
                }
            }
            Action::HardLock { .. } => {
                if answer.hardlock == Some(false) {
                    self.response.tif_on(TIF_FUNCTION_NOT_SUPPORTED | TIF_COMMAND_FAILED);
                    self.state = State::Complete;
                }
            }
            Action::Suk => {
                if let Some(suk) = &answer.suk {
                    self.response.add_param("suk", suk.clone());
                }
            }
            Action::Vuk => match &answer.vuk {
                None => return Err(RequestError::VukMissing),
                Some(None) => {
                    self.response.tif_on(TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE);
                    self.state = State::Complete;
                }
                Some(Some(vuk_key)) => {
                    let urs = self.params.get("urs");
                    let verified = urs.is_some_and(|urs| verify_signature(&self.tosign, vuk_key, urs));
                    if verified {
                        self.admin = true;
                        self.state = State::Valid;
                    } else {
                        self.response.tif_on(TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE);
                        self.state = State::Complete;
                    }
                }
            },
            Action::Btn { .. } | Action::Ins { .. } | Action::Pins { .. } => {}
        }
        Ok(())
    }

    /// Produces the final response once the request has reached
    /// `COMPLETE`, minting a replacement nut and resolving the next
    /// `qry` in the process.
    ///
    /// When `args.nut` is `None`, a fresh nut is generated from
    /// `args.ipaddr` (defaulting to this request's own address),
    /// `args.counter` (required in that case), and `args.timestamp`
    /// (defaulting to the current time). Its QR/link form is chosen to
    /// match the originally submitted nut's own flag, so a client that
    /// followed a link keeps being handed links.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::FinalizeMissingCounter`] if neither `nut`
    /// nor `counter` is supplied, or [`RequestError::Nut`] if generating
    /// the replacement nut fails.
    pub fn finalize(&self, args: FinalizeArgs) -> Result<Response, RequestError> {
        let old_nut_is_link = self
            .params
            .get("nut")
            .and_then(|raw| Nut::load(raw, self.master_key).ok())
            .map(|n| n.islink())
            .unwrap_or(false);

        let nut_string = if let Some(nut) = args.nut {
            nut
        } else {
            let counter = args.counter.ok_or(RequestError::FinalizeMissingCounter)?;
            let ipaddr = args.ipaddr.as_deref().unwrap_or(&self.ipaddr);
            let generated = generate_random(self.master_key, ipaddr, counter, args.timestamp)?;
            generated.for_flag(old_nut_is_link).to_string()
        };

        let qry_base = match args.qry {
            Some(q) => q,
            None => self.server.as_ref().and_then(ServerData::qry).unwrap_or("").to_string(),
        };
        let qry = stripurl(&addquery(&qry_base, &[("nut".to_string(), nut_string.clone())]));

        let mut response = Response::load(&self.response);
        response.add_param("nut", nut_string);
        response.add_param("qry", qry);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOption;
    use crate::codec::{Envelope, b64u_encode};
    use crate::nut::generate;
    use ed25519_dalek::{Signer, SigningKey};

    const KEY: [u8; 32] = [7u8; 32];
    const TTL: u32 = 600;

    fn test_signing_key(seed_byte: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed_byte; 32])
    }

    struct Fixture {
        params: Envelope,
        idk_b64: String,
    }

    fn build_request_params(
        cmd: &str,
        opts: &[ClientOption],
        nut: &str,
        signing_key: &SigningKey,
        extra_client_fields: &[(&str, &str)],
    ) -> Fixture {
        let idk_b64 = b64u_encode(signing_key.verifying_key().as_bytes());
        let mut client_pairs: Vec<(&str, &str)> = vec![("ver", "1"), ("cmd", cmd), ("idk", &idk_b64)];
        let opt_value;
        if !opts.is_empty() {
            opt_value = opts.iter().map(ToString::to_string).collect::<Vec<_>>().join("~");
            client_pairs.push(("opt", opt_value.as_str()));
        }
        client_pairs.extend_from_slice(extra_client_fields);
        let client_raw = Envelope::compose(&client_pairs);
        let client_b64 = b64u_encode(client_raw.as_bytes());

        let server_raw = "sqrl://example.com/sqrl?nut=OLDNUT&sfn=RXhhbXBsZQ";
        let server_b64 = b64u_encode(server_raw.as_bytes());

        let tosign = format!("{client_b64}{server_b64}");
        let signature = signing_key.sign(tosign.as_bytes());
        let ids_b64 = b64u_encode(&signature.to_bytes());

        let mut params = Envelope::new();
        params.insert("nut", nut);
        params.insert("client", client_b64);
        params.insert("server", server_b64);
        params.insert("ids", ids_b64);

        Fixture { params, idk_b64 }
    }

    fn fresh_nut(addr: &str, counter: u32) -> String {
        generate(&KEY, addr, counter, Some(1_700_000_000), [3, 3, 3, 3]).unwrap().qr
    }

    #[test]
    fn query_then_found_completes_with_ids_match_and_ip_matched() {
        let signing_key = test_signing_key(1);
        let nut = fresh_nut("203.0.113.9", 1);
        let fixture = build_request_params("query", &[], &nut, &signing_key, &[]);

        let mut request =
            Request::new(&KEY, fixture.params, "203.0.113.9", TTL, None, None, None);
        request.set_clock(1_700_000_010);
        let outcome = request.handle(Answer::default()).unwrap();
        let StepOutcome::Action(actions) = outcome else { panic!("expected an action") };
        assert_eq!(actions, vec![Action::Find { keys: vec![fixture.idk_b64] }]);

        let answer = Answer { find_found: Some(vec![true]), ..Answer::default() };
        let outcome = request.handle(answer).unwrap();
        assert_eq!(outcome, StepOutcome::Complete);
        assert_eq!(request.response.tif(), TIF_IDS_MATCH | TIF_IP_MATCHED);
    }

    #[test]
    fn query_disabled_identity_reports_suk() {
        let signing_key = test_signing_key(2);
        let nut = fresh_nut("203.0.113.9", 1);
        let fixture = build_request_params("query", &[], &nut, &signing_key, &[]);

        let mut request =
            Request::new(&KEY, fixture.params, "203.0.113.9", TTL, None, None, None);
        request.set_clock(1_700_000_010);
        request.handle(Answer::default()).unwrap();

        let answer = Answer {
            find_found: Some(vec![true]),
            find_disabled: true,
            find_suk: Some("SUK".to_string()),
            ..Answer::default()
        };
        let outcome = request.handle(answer).unwrap();
        assert_eq!(outcome, StepOutcome::Complete);
        assert_eq!(request.response.tif(), TIF_IDS_MATCH | TIF_IP_MATCHED | TIF_SQRL_DISABLED);
        assert_eq!(request.response.param("suk"), Some("SUK"));
    }

    #[test]
    fn bad_signature_fails_before_any_action_is_queued() {
        let signing_key = test_signing_key(3);
        let nut = fresh_nut("203.0.113.9", 1);
        let mut fixture = build_request_params("query", &[], &nut, &signing_key, &[]);
        let ids = fixture.params.get("ids").unwrap().to_string();
        let mut tampered = ids;
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });
        fixture.params.insert("ids", tampered);

        let mut request =
            Request::new(&KEY, fixture.params, "203.0.113.9", TTL, None, None, None);
        request.set_clock(1_700_000_010);
        let outcome = request.handle(Answer::default()).unwrap();
        assert_eq!(outcome, StepOutcome::Complete);
        assert_eq!(
            request.response.tif(),
            TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE
        );
    }

    #[test]
    fn ip_mismatch_queues_confirm_and_resumes_dispatch_on_acceptance() {
        let signing_key = test_signing_key(4);
        let nut = fresh_nut("203.0.113.9", 1);
        let fixture = build_request_params("query", &[], &nut, &signing_key, &[]);

        let mut request =
            Request::new(&KEY, fixture.params, "198.51.100.7", TTL, None, None, None);
        request.set_clock(1_700_000_010);
        let outcome = request.handle(Answer::default()).unwrap();
        assert_eq!(outcome, StepOutcome::Action(vec![Action::Confirm { errors: vec![ConfirmFlag::Ip] }]));

        let answer = Answer { confirmed: Some(false), ..Answer::default() };
        let outcome = request.handle(answer).unwrap();
        assert_eq!(outcome, StepOutcome::Complete);
        assert_eq!(request.response.tif(), TIF_TRANSIENT_ERROR | TIF_COMMAND_FAILED);
    }

    #[test]
    fn ip_mismatch_confirmed_true_resumes_into_find() {
        let signing_key = test_signing_key(5);
        let nut = fresh_nut("203.0.113.9", 1);
        let fixture = build_request_params("query", &[], &nut, &signing_key, &[]);
        let idk_b64 = fixture.idk_b64.clone();

        let mut request =
            Request::new(&KEY, fixture.params, "198.51.100.7", TTL, None, None, None);
        request.set_clock(1_700_000_010);
        request.handle(Answer::default()).unwrap();

        let answer = Answer { confirmed: Some(true), ..Answer::default() };
        let outcome = request.handle(answer).unwrap();
        assert_eq!(outcome, StepOutcome::Action(vec![Action::Find { keys: vec![idk_b64] }]));
    }

    #[test]
    fn ident_with_sqrlonly_rejection_fails() {
        let signing_key = test_signing_key(6);
        let nut = fresh_nut("203.0.113.9", 1);
        let fixture =
            build_request_params("ident", &[ClientOption::SqrlOnly], &nut, &signing_key, &[]);

        let mut request =
            Request::new(&KEY, fixture.params, "203.0.113.9", TTL, None, None, None);
        request.set_clock(1_700_000_010);
        let outcome = request.handle(Answer::default()).unwrap();
        let StepOutcome::Action(actions) = outcome else { panic!("expected actions") };
        assert!(actions.contains(&Action::SqrlOnly { requested: true }));
        assert!(actions.contains(&Action::HardLock { requested: false }));

        let answer = Answer {
            authenticated: Some(true),
            sqrlonly: Some(false),
            ..Answer::default()
        };
        let outcome = request.handle(answer).unwrap();
        assert_eq!(outcome, StepOutcome::Complete);
        assert!(request.response.tif() & TIF_FUNCTION_NOT_SUPPORTED != 0);
        assert!(request.response.tif() & TIF_COMMAND_FAILED != 0);
    }

    #[test]
    fn enable_without_admin_requests_vuk_then_rejects_bad_urs() {
        let signing_key = test_signing_key(7);
        let nut = fresh_nut("203.0.113.9", 1);
        let fixture = build_request_params("enable", &[], &nut, &signing_key, &[]);

        let mut request =
            Request::new(&KEY, fixture.params, "203.0.113.9", TTL, None, None, None);
        request.set_clock(1_700_000_010);
        let outcome = request.handle(Answer::default()).unwrap();
        assert_eq!(outcome, StepOutcome::Action(vec![Action::Vuk]));

        let answer = Answer { vuk: Some(Some("not-checked-without-urs".to_string())), ..Answer::default() };
        let outcome = request.handle(answer).unwrap();
        assert_eq!(outcome, StepOutcome::Complete);
        assert_eq!(
            request.response.tif(),
            TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE
        );
    }

    #[test]
    fn vuk_action_without_any_answer_is_fatal() {
        let signing_key = test_signing_key(8);
        let nut = fresh_nut("203.0.113.9", 1);
        let fixture = build_request_params("remove", &[], &nut, &signing_key, &[]);

        let mut request =
            Request::new(&KEY, fixture.params, "203.0.113.9", TTL, None, None, None);
        request.set_clock(1_700_000_010);
        request.handle(Answer::default()).unwrap();

        let err = request.handle(Answer::default()).unwrap_err();
        assert_eq!(err, RequestError::VukMissing);
    }

    #[test]
    fn ask_completes_request_with_command_failed() {
        let signing_key = test_signing_key(9);
        let nut = fresh_nut("203.0.113.9", 1);
        let fixture = build_request_params("query", &[], &nut, &signing_key, &[]);

        let mut request =
            Request::new(&KEY, fixture.params, "203.0.113.9", TTL, None, None, None);
        request.set_clock(1_700_000_010);
        let ask = AskRequest {
            msg: "Two buttons w/ URLs".to_string(),
            buttons: vec![
                AskButton { label: "Button 1".to_string(), url: Some("/url1".to_string()) },
                AskButton { label: "Button 2".to_string(), url: Some("/url2".to_string()) },
            ],
        };
        let answer = Answer { ask: Some(ask), ..Answer::default() };
        let outcome = request.handle(answer).unwrap();
        assert_eq!(outcome, StepOutcome::Complete);
        assert!(request.response.tif() & TIF_COMMAND_FAILED != 0);
        assert!(request.response.param("ask").is_some());
    }

    #[test]
    fn finalize_mints_a_fresh_nut_and_qry() {
        let signing_key = test_signing_key(10);
        let nut = fresh_nut("203.0.113.9", 1);
        let fixture = build_request_params("query", &[], &nut, &signing_key, &[]);

        let mut request =
            Request::new(&KEY, fixture.params, "203.0.113.9", TTL, None, None, None);
        request.set_clock(1_700_000_010);
        request.handle(Answer::default()).unwrap();
        request.handle(Answer { find_found: Some(vec![true]), ..Answer::default() }).unwrap();

        let response =
            request.finalize(FinalizeArgs { counter: Some(2), ..FinalizeArgs::default() }).unwrap();
        assert!(response.param("nut").is_some());
        assert!(response.param("qry").unwrap().contains("nut="));
    }

    #[test]
    fn finalize_without_nut_or_counter_is_an_error() {
        let signing_key = test_signing_key(11);
        let nut = fresh_nut("203.0.113.9", 1);
        let fixture = build_request_params("query", &[], &nut, &signing_key, &[]);

        let mut request =
            Request::new(&KEY, fixture.params, "203.0.113.9", TTL, None, None, None);
        request.set_clock(1_700_000_010);
        request.handle(Answer::default()).unwrap();
        request.handle(Answer { find_found: Some(vec![true]), ..Answer::default() }).unwrap();

        let err = request.finalize(FinalizeArgs::default()).unwrap_err();
        assert_eq!(err, RequestError::FinalizeMissingCounter);
    }
}
