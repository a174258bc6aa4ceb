use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Error for the textual forms of the enums below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.what, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase().replace([' ', '-'], "_")
}

/// Team function. Absences are grouped by role when looking for overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Functional,
    Integration,
    Deployment,
    ProjectLead,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::Functional,
        Role::Integration,
        Role::Deployment,
        Role::ProjectLead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Functional => "functional",
            Role::Integration => "integration",
            Role::Deployment => "deployment",
            Role::ProjectLead => "project_lead",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "functional" => Ok(Role::Functional),
            "integration" => Ok(Role::Integration),
            "deployment" => Ok(Role::Deployment),
            "project_lead" | "projectlead" | "lead" => Ok(Role::ProjectLead),
            _ => Err(ParseEnumError { what: "role", value: s.to_string() }),
        }
    }
}

/// What a ledger entry takes off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestKind {
    /// One full day, debits `vacation_balance` by 1.
    Vacation,
    /// A number of hours, debits `hour_balance`.
    DiscretionaryHours,
    /// Company-wide day off. Never debits anything.
    Holiday,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Vacation => "vacation",
            RequestKind::DiscretionaryHours => "hours",
            RequestKind::Holiday => "holiday",
        }
    }

    /// Balance units consumed by a request of this kind.
    pub fn cost(&self, hours: u32) -> u32 {
        match self {
            RequestKind::Vacation => 1,
            RequestKind::DiscretionaryHours => hours,
            RequestKind::Holiday => 0,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "vacation" | "v" => Ok(RequestKind::Vacation),
            "hours" | "discretionary_hours" | "discretionary" | "l" => {
                Ok(RequestKind::DiscretionaryHours)
            }
            "holiday" => Ok(RequestKind::Holiday),
            _ => Err(ParseEnumError { what: "request kind", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Overlapping,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Overlapping => "overlapping",
        }
    }

    /// Approved and flagged requests count towards overlaps; pending ones do not.
    pub fn is_committed(&self) -> bool {
        matches!(self, RequestStatus::Approved | RequestStatus::Overlapping)
    }

    pub fn color(&self) -> ColorTag {
        match self {
            RequestStatus::Pending => ColorTag::Blue,
            RequestStatus::Approved => ColorTag::Green,
            RequestStatus::Overlapping => ColorTag::Red,
            RequestStatus::Rejected => ColorTag::Gray,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            "overlapping" => Ok(RequestStatus::Overlapping),
            _ => Err(ParseEnumError { what: "request status", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HolidayKind {
    National,
    Regional,
}

impl HolidayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HolidayKind::National => "national",
            HolidayKind::Regional => "regional",
        }
    }
}

impl fmt::Display for HolidayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HolidayKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "national" | "fn" => Ok(HolidayKind::National),
            "regional" | "fr" => Ok(HolidayKind::Regional),
            _ => Err(ParseEnumError { what: "holiday kind", value: s.to_string() }),
        }
    }
}

/// Calendar color for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorTag {
    Blue,
    Green,
    Red,
    Gray,
    Yellow,
}

impl ColorTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColorTag::Blue => "blue",
            ColorTag::Green => "green",
            ColorTag::Red => "red",
            ColorTag::Gray => "gray",
            ColorTag::Yellow => "yellow",
        }
    }

    /// Readable text color on top of this background.
    pub fn text_color(&self) -> &'static str {
        match self {
            ColorTag::Yellow => "black",
            _ => "white",
        }
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub role: Role,
    /// Days left.
    pub vacation_balance: u32,
    /// Discretionary hours left.
    pub hour_balance: u32,
}

impl Member {
    /// Remaining balance for `kind`. Holidays have no balance.
    pub fn balance(&self, kind: RequestKind) -> Option<u32> {
        match kind {
            RequestKind::Vacation => Some(self.vacation_balance),
            RequestKind::DiscretionaryHours => Some(self.hour_balance),
            RequestKind::Holiday => None,
        }
    }

    /// Take `amount` off the balance for `kind`, never going below zero.
    pub fn debit(&mut self, kind: RequestKind, amount: u32) {
        match kind {
            RequestKind::Vacation => {
                self.vacation_balance = self.vacation_balance.saturating_sub(amount)
            }
            RequestKind::DiscretionaryHours => {
                self.hour_balance = self.hour_balance.saturating_sub(amount)
            }
            RequestKind::Holiday => {}
        }
    }
}

/// A day-off request in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: Ulid,
    /// Member name. The member may have been removed since.
    pub member: String,
    /// Role of the member when the request was made.
    pub role: Role,
    pub kind: RequestKind,
    pub date: NaiveDate,
    /// Non-zero only for discretionary hours.
    pub hours: u32,
    pub status: RequestStatus,
    pub comment: Option<String>,
}

impl Request {
    pub fn cost(&self) -> u32 {
        self.kind.cost(self.hours)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holiday {
    pub id: Ulid,
    pub date: NaiveDate,
    pub label: String,
    pub kind: HolidayKind,
}

/// Ledger mutations as written to the WAL. Replaying them in order rebuilds the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MemberUpserted {
        name: String,
        role: Role,
        vacation_balance: u32,
        hour_balance: u32,
    },
    MemberRemoved {
        name: String,
    },
    BalanceDebited {
        name: String,
        kind: RequestKind,
        amount: u32,
    },
    RequestCreated {
        id: Ulid,
        member: String,
        role: Role,
        kind: RequestKind,
        date: NaiveDate,
        hours: u32,
        comment: Option<String>,
    },
    /// Debit, status change and overlap re-flagging of one approval.
    RequestApproved {
        id: Ulid,
        status: RequestStatus,
        comment: Option<String>,
        debit: u32,
        /// Other committed requests on the same day and role, set to `status` as well.
        reflagged: Vec<Ulid>,
    },
    RequestRejected {
        id: Ulid,
        comment: Option<String>,
    },
    RequestDeleted {
        id: Ulid,
    },
    /// Full request record, written by compaction.
    RequestRestored {
        request: Request,
    },
    HolidayAdded {
        id: Ulid,
        date: NaiveDate,
        label: String,
        kind: HolidayKind,
    },
    HolidayRemoved {
        id: Ulid,
    },
}

// ── Query types ──────────────────────────────────────────────────

/// Optional filters for listing requests. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub member: Option<String>,
    pub status: Option<RequestStatus>,
    pub date: Option<NaiveDate>,
}

impl RequestFilter {
    pub fn matches(&self, request: &Request) -> bool {
        self.member.as_deref().is_none_or(|m| m == request.member)
            && self.status.is_none_or(|s| s == request.status)
            && self.date.is_none_or(|d| d == request.date)
    }
}

/// Where a calendar entry comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarSource {
    Request(Ulid),
    Holiday(Ulid),
    Weekend,
}

/// One entry of the calendar feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarEvent {
    pub title: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub color: ColorTag,
    #[serde(rename = "textColor")]
    pub text_color: &'static str,
    #[serde(skip)]
    pub source: CalendarSource,
}

/// Per-member pivot of requests by kind and status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberSummary {
    pub name: String,
    pub role: Option<Role>,
    /// `None` once the member has been removed.
    pub vacation_balance: Option<u32>,
    pub hour_balance: Option<u32>,
    pub vacation_pending: u32,
    /// Approved plus overlapping vacation days.
    pub vacation_approved: u32,
    pub vacation_rejected: u32,
    pub hours_pending: u32,
    pub hours_approved: u32,
    pub hours_rejected: u32,
    pub overlapping: u32,
}

/// A committed request that is part of an over-threshold group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapConflict {
    pub request_id: Ulid,
    pub member: String,
    pub date: NaiveDate,
    pub role: Role,
    pub status: RequestStatus,
    /// Other members absent on the same day with the same role.
    pub coincides_with: Vec<String>,
}
