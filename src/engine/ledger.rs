use chrono::{Datelike, NaiveDate};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::overlap::evaluate_candidate;
use super::registry::ensure_available;
use super::{Engine, EngineError};

pub(crate) fn validate_date(date: NaiveDate) -> Result<(), EngineError> {
    if !(MIN_YEAR..=MAX_YEAR).contains(&date.year()) {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

fn validate_comment(comment: Option<&str>) -> Result<(), EngineError> {
    if comment.is_some_and(|c| c.len() > MAX_COMMENT_LEN) {
        return Err(EngineError::LimitExceeded("comment too long"));
    }
    Ok(())
}

/// Checks the hours/kind pairing: hours only (and always) for discretionary hours.
fn validate_hours(kind: RequestKind, hours: u32) -> Result<(), EngineError> {
    match kind {
        RequestKind::Holiday => Err(EngineError::InvalidRequest(
            "holidays are added to the calendar, not requested",
        )),
        RequestKind::Vacation if hours != 0 => Err(EngineError::InvalidRequest(
            "vacation requests cover a full day and take no hours",
        )),
        RequestKind::DiscretionaryHours
            if !(MIN_DISCRETIONARY_HOURS..=MAX_DISCRETIONARY_HOURS).contains(&hours) =>
        {
            Err(EngineError::InvalidRequest("discretionary hours must be between 1 and 8"))
        }
        _ => Ok(()),
    }
}

impl Engine {
    /// File a Pending request for `member`. Balances are checked but only
    /// debited on approval.
    pub async fn create_request(
        &self,
        member: &str,
        kind: RequestKind,
        date: NaiveDate,
        hours: u32,
        comment: Option<String>,
    ) -> Result<Ulid, EngineError> {
        let id = Ulid::new();
        self.create_request_with_id(id, member, kind, date, hours, comment)
            .await?;
        Ok(id)
    }

    /// Same as [`Engine::create_request`] with a caller-chosen id.
    pub async fn create_request_with_id(
        &self,
        id: Ulid,
        member: &str,
        kind: RequestKind,
        date: NaiveDate,
        hours: u32,
        comment: Option<String>,
    ) -> Result<(), EngineError> {
        validate_hours(kind, hours)?;
        validate_date(date)?;
        validate_comment(comment.as_deref())?;

        let mut store = self.store.write().await;
        if store.request(&id).is_some() {
            return Err(EngineError::DuplicateId(id));
        }
        if store.request_count() >= MAX_REQUESTS {
            return Err(EngineError::LimitExceeded("too many requests"));
        }
        let m = store
            .member(member)
            .ok_or_else(|| EngineError::MemberNotFound(member.to_string()))?;
        ensure_available(m, kind, kind.cost(hours))?;
        let role = m.role;

        let event = Event::RequestCreated {
            id,
            member: member.to_string(),
            role,
            kind,
            date,
            hours,
            comment,
        };
        self.persist_and_apply(&mut store, event).await?;
        info!("request {id}: {member} ({role}) {kind} on {date}");
        Ok(())
    }

    /// Approve a Pending request: debit the member and flag overlaps.
    /// Returns the resulting status (Approved or Overlapping).
    pub async fn approve(
        &self,
        id: Ulid,
        comment: Option<String>,
    ) -> Result<RequestStatus, EngineError> {
        validate_comment(comment.as_deref())?;
        let mut store = self.store.write().await;
        let request = store
            .request(&id)
            .ok_or(EngineError::RequestNotFound(id))?;
        if request.status != RequestStatus::Pending {
            debug!("approve {id}: already {}", request.status);
            metrics::counter!(crate::observability::APPROVALS_TOTAL, "outcome" => "invalid_transition")
                .increment(1);
            return Err(EngineError::InvalidTransition {
                id,
                from: request.status,
                to: RequestStatus::Approved,
            });
        }
        let member = store
            .member(&request.member)
            .ok_or_else(|| EngineError::MemberNotFound(request.member.clone()))?;
        let debit = request.cost();
        if let Err(e) = ensure_available(member, request.kind, debit) {
            metrics::counter!(crate::observability::APPROVALS_TOTAL, "outcome" => "insufficient_balance")
                .increment(1);
            return Err(e);
        }

        let verdict = evaluate_candidate(store.requests(), request, &self.config.overlap);
        let status = verdict.status();
        let (member_name, date, role) = (request.member.clone(), request.date, request.role);

        let event = Event::RequestApproved {
            id,
            status,
            comment,
            debit,
            reflagged: verdict.others,
        };
        self.persist_and_apply(&mut store, event).await?;
        metrics::counter!(crate::observability::APPROVALS_TOTAL, "outcome" => status.as_str())
            .increment(1);
        info!("request {id} for {member_name} on {date} ({role}): {status}");
        Ok(status)
    }

    /// Reject a request in any status. Balances are left as they are.
    pub async fn reject(&self, id: Ulid, comment: Option<String>) -> Result<(), EngineError> {
        validate_comment(comment.as_deref())?;
        let mut store = self.store.write().await;
        let previous = store
            .request(&id)
            .ok_or(EngineError::RequestNotFound(id))?
            .status;

        self.persist_and_apply(&mut store, Event::RequestRejected { id, comment })
            .await?;
        info!("request {id} rejected (was {previous})");
        Ok(())
    }

    /// Drop a request from the ledger. A balance already debited for it is not
    /// restored.
    pub async fn delete_request(&self, id: Ulid) -> Result<Request, EngineError> {
        let mut store = self.store.write().await;
        let removed = store
            .request(&id)
            .cloned()
            .ok_or(EngineError::RequestNotFound(id))?;

        self.persist_and_apply(&mut store, Event::RequestDeleted { id })
            .await?;
        info!("request {id} deleted (was {})", removed.status);
        Ok(removed)
    }

    pub async fn get_request(&self, id: Ulid) -> Result<Request, EngineError> {
        self.store
            .read()
            .await
            .request(&id)
            .cloned()
            .ok_or(EngineError::RequestNotFound(id))
    }

    pub async fn list_requests(&self, filter: &RequestFilter) -> Vec<Request> {
        self.store
            .read()
            .await
            .requests()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub async fn add_holiday(
        &self,
        date: NaiveDate,
        label: &str,
        kind: HolidayKind,
    ) -> Result<Ulid, EngineError> {
        let id = Ulid::new();
        self.add_holiday_with_id(id, date, label, kind).await?;
        Ok(id)
    }

    pub async fn add_holiday_with_id(
        &self,
        id: Ulid,
        date: NaiveDate,
        label: &str,
        kind: HolidayKind,
    ) -> Result<(), EngineError> {
        validate_date(date)?;
        if label.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("holiday label too long"));
        }

        let mut store = self.store.write().await;
        if store.holiday(&id).is_some() {
            return Err(EngineError::DuplicateId(id));
        }
        if store.holiday_count() >= MAX_HOLIDAYS {
            return Err(EngineError::LimitExceeded("too many holidays"));
        }

        let event = Event::HolidayAdded {
            id,
            date,
            label: label.to_string(),
            kind,
        };
        self.persist_and_apply(&mut store, event).await?;
        info!("holiday {id}: {label} ({kind}) on {date}");
        Ok(())
    }

    pub async fn remove_holiday(&self, id: Ulid) -> Result<Holiday, EngineError> {
        let mut store = self.store.write().await;
        let removed = store
            .holiday(&id)
            .cloned()
            .ok_or(EngineError::HolidayNotFound(id))?;
        self.persist_and_apply(&mut store, Event::HolidayRemoved { id })
            .await?;
        info!("holiday {id} removed");
        Ok(removed)
    }

    /// Holidays ordered by date.
    pub async fn list_holidays(&self) -> Vec<Holiday> {
        let mut holidays: Vec<Holiday> = self.store.read().await.holidays().cloned().collect();
        holidays.sort_by_key(|h| (h.date, h.id));
        holidays
    }
}
