use std::collections::BTreeMap;

use tracing::warn;
use ulid::Ulid;

use crate::model::*;

/// All ledger state: members by name, requests and holidays by id.
///
/// Only mutated through [`LedgerStore::apply`], so replaying the WAL and
/// serving live mutations go through the same code.
#[derive(Debug, Default)]
pub struct LedgerStore {
    members: BTreeMap<String, Member>,
    requests: BTreeMap<Ulid, Request>,
    holidays: BTreeMap<Ulid, Holiday>,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Members ──────────────────────────────────────────────

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    // ── Requests ─────────────────────────────────────────────

    pub fn request(&self, id: &Ulid) -> Option<&Request> {
        self.requests.get(id)
    }

    /// Requests in creation order (ULIDs sort by time).
    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        self.requests.values()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    // ── Holidays ─────────────────────────────────────────────

    pub fn holiday(&self, id: &Ulid) -> Option<&Holiday> {
        self.holidays.get(id)
    }

    pub fn holidays(&self) -> impl Iterator<Item = &Holiday> {
        self.holidays.values()
    }

    pub fn holiday_count(&self) -> usize {
        self.holidays.len()
    }

    // ── Event application ────────────────────────────────────

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::MemberUpserted {
                name,
                role,
                vacation_balance,
                hour_balance,
            } => {
                self.members.insert(
                    name.clone(),
                    Member {
                        name: name.clone(),
                        role: *role,
                        vacation_balance: *vacation_balance,
                        hour_balance: *hour_balance,
                    },
                );
            }
            Event::MemberRemoved { name } => {
                self.members.remove(name);
            }
            Event::BalanceDebited { name, kind, amount } => {
                if let Some(m) = self.members.get_mut(name) {
                    m.debit(*kind, *amount);
                }
            }
            Event::RequestCreated {
                id,
                member,
                role,
                kind,
                date,
                hours,
                comment,
            } => {
                self.requests.insert(
                    *id,
                    Request {
                        id: *id,
                        member: member.clone(),
                        role: *role,
                        kind: *kind,
                        date: *date,
                        hours: *hours,
                        status: RequestStatus::Pending,
                        comment: comment.clone(),
                    },
                );
            }
            Event::RequestApproved {
                id,
                status,
                comment,
                debit,
                reflagged,
            } => {
                let Some(req) = self.requests.get_mut(id) else {
                    warn!("approval for unknown request {id} ignored");
                    return;
                };
                req.status = *status;
                if comment.is_some() {
                    req.comment = comment.clone();
                }
                let (name, kind) = (req.member.clone(), req.kind);
                if let Some(m) = self.members.get_mut(&name) {
                    m.debit(kind, *debit);
                }
                for other in reflagged {
                    if let Some(r) = self.requests.get_mut(other)
                        && r.status.is_committed()
                    {
                        r.status = *status;
                    }
                }
            }
            Event::RequestRejected { id, comment } => {
                if let Some(req) = self.requests.get_mut(id) {
                    req.status = RequestStatus::Rejected;
                    if comment.is_some() {
                        req.comment = comment.clone();
                    }
                }
            }
            Event::RequestDeleted { id } => {
                self.requests.remove(id);
            }
            Event::RequestRestored { request } => {
                self.requests.insert(request.id, request.clone());
            }
            Event::HolidayAdded {
                id,
                date,
                label,
                kind,
            } => {
                self.holidays.insert(
                    *id,
                    Holiday {
                        id: *id,
                        date: *date,
                        label: label.clone(),
                        kind: *kind,
                    },
                );
            }
            Event::HolidayRemoved { id } => {
                self.holidays.remove(id);
            }
        }
    }

    /// Events that rebuild exactly the current state. Used for WAL compaction.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events =
            Vec::with_capacity(self.members.len() + self.requests.len() + self.holidays.len());
        events.extend(self.members.values().map(|m| Event::MemberUpserted {
            name: m.name.clone(),
            role: m.role,
            vacation_balance: m.vacation_balance,
            hour_balance: m.hour_balance,
        }));
        events.extend(
            self.requests
                .values()
                .map(|r| Event::RequestRestored { request: r.clone() }),
        );
        events.extend(self.holidays.values().map(|h| Event::HolidayAdded {
            id: h.id,
            date: h.date,
            label: h.label.clone(),
            kind: h.kind,
        }));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn upsert(name: &str, vacation: u32, hours: u32) -> Event {
        Event::MemberUpserted {
            name: name.into(),
            role: Role::Functional,
            vacation_balance: vacation,
            hour_balance: hours,
        }
    }

    fn created(id: Ulid, member: &str, kind: RequestKind, hours: u32) -> Event {
        Event::RequestCreated {
            id,
            member: member.into(),
            role: Role::Functional,
            kind,
            date: NaiveDate::from_ymd_opt(2024, 7, 15).unwrap(),
            hours,
            comment: None,
        }
    }

    #[test]
    fn approval_debits_and_reflags_committed_only() {
        let mut store = LedgerStore::new();
        store.apply(&upsert("ana", 2, 0));
        store.apply(&upsert("luis", 2, 0));
        let (a, b, pending) = (Ulid::new(), Ulid::new(), Ulid::new());
        store.apply(&created(a, "ana", RequestKind::Vacation, 0));
        store.apply(&created(b, "luis", RequestKind::Vacation, 0));
        store.apply(&created(pending, "luis", RequestKind::Vacation, 0));
        store.apply(&Event::RequestApproved {
            id: a,
            status: RequestStatus::Approved,
            comment: None,
            debit: 1,
            reflagged: vec![],
        });
        store.apply(&Event::RequestApproved {
            id: b,
            status: RequestStatus::Overlapping,
            comment: Some("busy week".into()),
            debit: 1,
            reflagged: vec![a, pending],
        });

        assert_eq!(store.request(&a).unwrap().status, RequestStatus::Overlapping);
        assert_eq!(store.request(&b).unwrap().status, RequestStatus::Overlapping);
        assert_eq!(store.request(&b).unwrap().comment.as_deref(), Some("busy week"));
        // pending requests are never reflagged
        assert_eq!(store.request(&pending).unwrap().status, RequestStatus::Pending);
        assert_eq!(store.member("ana").unwrap().vacation_balance, 1);
        assert_eq!(store.member("luis").unwrap().vacation_balance, 1);
    }

    #[test]
    fn requests_outlive_removed_members() {
        let mut store = LedgerStore::new();
        store.apply(&upsert("ana", 1, 8));
        let id = Ulid::new();
        store.apply(&created(id, "ana", RequestKind::DiscretionaryHours, 4));
        store.apply(&Event::MemberRemoved { name: "ana".into() });

        assert!(store.member("ana").is_none());
        assert_eq!(store.request(&id).unwrap().member, "ana");
    }

    #[test]
    fn snapshot_rebuilds_same_state() {
        let mut store = LedgerStore::new();
        store.apply(&upsert("ana", 3, 8));
        let id = Ulid::new();
        store.apply(&created(id, "ana", RequestKind::DiscretionaryHours, 4));
        store.apply(&Event::RequestApproved {
            id,
            status: RequestStatus::Approved,
            comment: None,
            debit: 4,
            reflagged: vec![],
        });
        store.apply(&Event::HolidayAdded {
            id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2024, 8, 15).unwrap(),
            label: "Assumption".into(),
            kind: HolidayKind::National,
        });

        let mut rebuilt = LedgerStore::new();
        for e in store.snapshot_events() {
            rebuilt.apply(&e);
        }
        assert_eq!(rebuilt.members().collect::<Vec<_>>(), store.members().collect::<Vec<_>>());
        assert_eq!(rebuilt.requests().collect::<Vec<_>>(), store.requests().collect::<Vec<_>>());
        assert_eq!(rebuilt.holidays().collect::<Vec<_>>(), store.holidays().collect::<Vec<_>>());
        // the restored approval does not debit a second time
        assert_eq!(rebuilt.member("ana").unwrap().hour_balance, 4);
    }
}
