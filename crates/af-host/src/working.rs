//! The host's working copy of the request under construction.
//!
//! Every mutation message is applied as it arrives. Store messages carry a
//! full snapshot, so each replaces its store wholesale and the copy converges
//! regardless of how messages from different stores interleave.

use std::collections::BTreeMap;

use af_sandbox::{BodyType, InitialState, SandboxMessage, ScalarField, StoreName};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Mutable copy of the request, seeded from the same snapshot as the sandbox.
#[derive(Debug, Clone)]
pub struct WorkingCopy {
    state: InitialState,
    applied: usize,
}

impl WorkingCopy {
    /// Start from the seed snapshot.
    pub fn new(seed: InitialState) -> Self {
        Self {
            state: seed,
            applied: 0,
        }
    }

    /// Current request state.
    pub fn state(&self) -> &InitialState {
        &self.state
    }

    /// Number of mutations applied so far.
    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Finish and take the request state.
    pub fn into_state(self) -> InitialState {
        self.state
    }

    /// Apply one sandbox message. Returns whether it changed the copy.
    pub fn apply(&mut self, msg: &SandboxMessage) -> bool {
        let changed = match msg {
            SandboxMessage::StoreChanged {
                store, snapshot, ..
            } => self.apply_snapshot(*store, snapshot),
            SandboxMessage::FieldChanged { field, value } => self.apply_field(*field, value),
            SandboxMessage::RawBodyChanged { value } => {
                self.state.body.raw = value.clone();
                true
            }
            SandboxMessage::BinaryBodyChanged { value } => {
                self.state.body.binary = value.clone();
                true
            }
            _ => false,
        };
        if changed {
            self.applied += 1;
        }
        changed
    }

    fn apply_snapshot(&mut self, store: StoreName, snapshot: &Value) -> bool {
        let s = &mut self.state;
        match store {
            StoreName::QueryParams => replace(&mut s.query_params, store, snapshot),
            StoreName::PathParams => replace(&mut s.path_params, store, snapshot),
            StoreName::Headers => replace(&mut s.headers, store, snapshot),
            StoreName::JsonBody => replace(&mut s.body.json, store, snapshot),
            StoreName::UrlencodedBody => replace(&mut s.body.urlencoded, store, snapshot),
            StoreName::FormdataBody => replace(&mut s.body.formdata, store, snapshot),
            StoreName::Cookies => replace(&mut s.cookies, store, snapshot),
            StoreName::LocalStorage => replace(&mut s.local_storage, store, snapshot),
            StoreName::SessionStorage => replace(&mut s.session_storage, store, snapshot),
            StoreName::Variables => {
                // mid-script variable changes do not affect the sent request
                tracing::debug!("variable change ignored");
                false
            }
        }
    }

    fn apply_field(&mut self, field: ScalarField, value: &str) -> bool {
        match field {
            ScalarField::Method => self.state.method = value.to_string(),
            ScalarField::Url => self.state.url = value.to_string(),
            ScalarField::Path => self.state.path = value.to_string(),
            ScalarField::BodyType => match BodyType::parse(value) {
                Some(body_type) => self.state.body_type = body_type,
                None => {
                    tracing::warn!(value, "unknown body type in field change, ignored");
                    return false;
                }
            },
        }
        true
    }
}

fn replace<V: DeserializeOwned>(
    target: &mut BTreeMap<String, V>,
    store: StoreName,
    snapshot: &Value,
) -> bool {
    match serde_json::from_value::<BTreeMap<String, V>>(snapshot.clone()) {
        Ok(entries) => {
            *target = entries;
            true
        }
        Err(e) => {
            tracing::warn!(%store, error = %e, "malformed store snapshot, ignored");
            false
        }
    }
}
