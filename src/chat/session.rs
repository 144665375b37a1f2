//! Reconciles the caller's stable conversation id with the upstream engine's
//! session id.
//!
//! A new conversation binds on the first observed upstream id. A resumed
//! conversation may see the engine mint a new id exactly once; repeats of that
//! new id are no-ops and any further change is rejected. After
//! [`SessionReconciler::finish`] no observation mutates anything.

use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of the conversation a request belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    /// Caller-stable id. May be empty for a new conversation and filled from
    /// the first upstream id.
    pub internal_id: Option<String>,
    /// Upstream id known before the request (resume) or learned during it.
    pub upstream_id: Option<String>,
    pub is_new_conversation: bool,
}

impl SessionRef {
    pub fn new_conversation(internal_id: Option<String>) -> Self {
        Self {
            internal_id,
            upstream_id: None,
            is_new_conversation: true,
        }
    }

    pub fn resumed(internal_id: impl Into<String>, upstream_id: impl Into<String>) -> Self {
        Self {
            internal_id: Some(internal_id.into()),
            upstream_id: Some(upstream_id.into()),
            is_new_conversation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    NewConversation,
    ResumedConversation,
    Bound,
    Finished,
}

/// Side effect the caller must perform after an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// First upstream id for a new conversation: create the record keyed by
    /// `internal_id`, storing `upstream_id` as an attribute.
    CreateConversation {
        internal_id: String,
        upstream_id: String,
    },
    /// The engine rotated the session on resume.
    UpdateUpstreamId {
        internal_id: String,
        upstream_id: String,
    },
    Unchanged,
    /// A change that the state machine does not allow; ignored.
    Rejected,
}

/// Identity settled at the end of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalBinding {
    pub internal_id: String,
    pub upstream_id: Option<String>,
    /// Whether any upstream id was observed during this request.
    pub observed: bool,
}

#[derive(Debug)]
pub struct SessionReconciler {
    session: SessionRef,
    state: State,
    observed: bool,
}

impl SessionReconciler {
    pub fn new(session: SessionRef) -> Self {
        let state = match (&session.upstream_id, session.is_new_conversation) {
            (Some(_), false) => State::ResumedConversation,
            (None, false) => {
                warn!(
                    internal_id = ?session.internal_id,
                    "Resumed conversation without a known upstream id; treating upstream id as unbound"
                );
                State::NewConversation
            }
            (_, true) => State::NewConversation,
        };
        Self {
            session,
            state,
            observed: false,
        }
    }

    pub fn is_new_conversation(&self) -> bool {
        self.session.is_new_conversation
    }

    pub fn internal_id(&self) -> Option<&str> {
        self.session.internal_id.as_deref()
    }

    pub fn upstream_id(&self) -> Option<&str> {
        self.session.upstream_id.as_deref()
    }

    /// Internal id, minting one if none exists yet. Stable once assigned.
    pub fn ensure_internal_id(&mut self) -> String {
        self.session
            .internal_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone()
    }

    /// Apply an upstream session id seen on the stream.
    pub fn observe(&mut self, value: &str) -> Reconciliation {
        match self.state {
            State::Finished => {
                debug!(value, "Session id observed after request finished; ignoring");
                Reconciliation::Rejected
            }
            State::NewConversation => {
                self.observed = true;
                let internal_id = self
                    .session
                    .internal_id
                    .get_or_insert_with(|| value.to_string())
                    .clone();
                self.session.upstream_id = Some(value.to_string());
                self.state = State::Bound;
                info!(internal_id = %internal_id, upstream_id = value, "Conversation bound to upstream session");
                Reconciliation::CreateConversation {
                    internal_id,
                    upstream_id: value.to_string(),
                }
            }
            State::ResumedConversation => {
                self.observed = true;
                if self.session.upstream_id.as_deref() == Some(value) {
                    return Reconciliation::Unchanged;
                }
                let internal_id = self.ensure_internal_id();
                info!(
                    internal_id = %internal_id,
                    previous = ?self.session.upstream_id,
                    upstream_id = value,
                    "Upstream rotated session on resume"
                );
                self.session.upstream_id = Some(value.to_string());
                self.state = State::Bound;
                Reconciliation::UpdateUpstreamId {
                    internal_id,
                    upstream_id: value.to_string(),
                }
            }
            State::Bound => {
                if self.session.upstream_id.as_deref() == Some(value) {
                    Reconciliation::Unchanged
                } else {
                    warn!(
                        current = ?self.session.upstream_id,
                        observed = value,
                        "Ignoring second upstream session id change within one request"
                    );
                    Reconciliation::Rejected
                }
            }
        }
    }

    /// Settle the identity at `Done`/`Error`. Later observations are rejected.
    pub fn finish(&mut self) -> FinalBinding {
        let internal_id = self.ensure_internal_id();
        if !self.observed && self.session.is_new_conversation {
            warn!(
                internal_id = %internal_id,
                "No upstream session id obtained for new conversation"
            );
        }
        self.state = State::Finished;
        FinalBinding {
            internal_id,
            upstream_id: self.session.upstream_id.clone(),
            observed: self.observed,
        }
    }
}
