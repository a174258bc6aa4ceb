use ulid::Ulid;

use crate::model::{RequestKind, RequestStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    MemberNotFound(String),
    RequestNotFound(Ulid),
    HolidayNotFound(Ulid),
    /// Only raised when the registry is configured to reject re-registration.
    DuplicateMember(String),
    /// A client-supplied request or holiday id that is already taken.
    DuplicateId(Ulid),
    InsufficientBalance {
        member: String,
        kind: RequestKind,
        available: u32,
        requested: u32,
    },
    InvalidTransition {
        id: Ulid,
        from: RequestStatus,
        to: RequestStatus,
    },
    InvalidRequest(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::MemberNotFound(name) => write!(f, "member not found: {name}"),
            EngineError::RequestNotFound(id) => write!(f, "request not found: {id}"),
            EngineError::HolidayNotFound(id) => write!(f, "holiday not found: {id}"),
            EngineError::DuplicateMember(name) => write!(f, "member already registered: {name}"),
            EngineError::DuplicateId(id) => write!(f, "id already in use: {id}"),
            EngineError::InsufficientBalance {
                member,
                kind,
                available,
                requested,
            } => write!(
                f,
                "insufficient {kind} balance for {member}: {available} available, {requested} requested"
            ),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "request {id} cannot go from {from} to {to}")
            }
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
