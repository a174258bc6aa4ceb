use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// How many same-role members may be off on the same day before their
/// requests are flagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapPolicy {
    pub default_threshold: u32,
    pub per_role: BTreeMap<Role, u32>,
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        Self {
            default_threshold: 1,
            per_role: BTreeMap::new(),
        }
    }
}

impl OverlapPolicy {
    pub fn with_threshold(default_threshold: u32) -> Self {
        Self {
            default_threshold,
            per_role: BTreeMap::new(),
        }
    }

    pub fn with_role_threshold(mut self, role: Role, threshold: u32) -> Self {
        self.per_role.insert(role, threshold);
        self
    }

    pub fn threshold_for(&self, role: Role) -> u32 {
        self.per_role
            .get(&role)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    pub fn is_exceeded(&self, role: Role, absent: usize) -> bool {
        absent > self.threshold_for(role) as usize
    }

    /// Parse `functional=2,integration=1` style overrides.
    pub fn parse_role_thresholds(s: &str) -> Result<BTreeMap<Role, u32>, String> {
        let mut out = BTreeMap::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (role, n) = part
                .split_once('=')
                .ok_or_else(|| format!("expected role=threshold, got {part:?}"))?;
            let role: Role = role.parse().map_err(|e| format!("{e}"))?;
            let n: u32 = n
                .trim()
                .parse()
                .map_err(|e| format!("bad threshold for {role}: {e}"))?;
            out.insert(role, n);
        }
        Ok(out)
    }
}

/// Committed requests on `date` whose snapshotted role is `role`.
pub fn committed_group<'a>(
    requests: impl IntoIterator<Item = &'a Request>,
    date: NaiveDate,
    role: Role,
) -> impl Iterator<Item = &'a Request> {
    requests
        .into_iter()
        .filter(move |r| r.date == date && r.role == role && r.status.is_committed())
}

/// True when too many same-role members are off on `date`.
pub fn detect_overlap<'a>(
    requests: impl IntoIterator<Item = &'a Request>,
    date: NaiveDate,
    role: Role,
    policy: &OverlapPolicy,
) -> bool {
    policy.is_exceeded(role, committed_group(requests, date, role).count())
}

/// Ids of every request in the `(date, role)` group when it conflicts, empty
/// otherwise. Membership is per group, so A conflicting with B implies B
/// conflicts with A.
pub fn conflicting_ids<'a>(
    requests: impl IntoIterator<Item = &'a Request>,
    date: NaiveDate,
    role: Role,
    policy: &OverlapPolicy,
) -> BTreeSet<Ulid> {
    let group: BTreeSet<Ulid> = committed_group(requests, date, role).map(|r| r.id).collect();
    if policy.is_exceeded(role, group.len()) {
        group
    } else {
        BTreeSet::new()
    }
}

/// Result of evaluating a group as if `candidate` were already committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub conflict: bool,
    /// Committed requests in the group other than the candidate.
    pub others: Vec<Ulid>,
}

impl Verdict {
    pub fn status(&self) -> RequestStatus {
        if self.conflict {
            RequestStatus::Overlapping
        } else {
            RequestStatus::Approved
        }
    }
}

pub fn evaluate_candidate<'a>(
    requests: impl IntoIterator<Item = &'a Request>,
    candidate: &Request,
    policy: &OverlapPolicy,
) -> Verdict {
    let others: Vec<Ulid> = committed_group(requests, candidate.date, candidate.role)
        .filter(|r| r.id != candidate.id)
        .map(|r| r.id)
        .collect();
    Verdict {
        conflict: policy.is_exceeded(candidate.role, others.len() + 1),
        others,
    }
}

/// Every committed request in an over-threshold `(date, role)` group, with the
/// names of the other members absent that day.
pub fn overlap_report<'a>(
    requests: impl IntoIterator<Item = &'a Request>,
    policy: &OverlapPolicy,
) -> Vec<OverlapConflict> {
    let mut groups: BTreeMap<(NaiveDate, Role), Vec<&Request>> = BTreeMap::new();
    for r in requests.into_iter().filter(|r| r.status.is_committed()) {
        groups.entry((r.date, r.role)).or_default().push(r);
    }

    let mut report = Vec::new();
    for ((date, role), group) in groups {
        if !policy.is_exceeded(role, group.len()) {
            continue;
        }
        for r in &group {
            let mut coincides_with: Vec<String> = group
                .iter()
                .filter(|o| o.id != r.id && o.member != r.member)
                .map(|o| o.member.clone())
                .collect();
            coincides_with.sort();
            coincides_with.dedup();
            report.push(OverlapConflict {
                request_id: r.id,
                member: r.member.clone(),
                date,
                role,
                status: r.status,
                coincides_with,
            });
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    fn req(member: &str, role: Role, date: NaiveDate, status: RequestStatus) -> Request {
        Request {
            id: Ulid::new(),
            member: member.into(),
            role,
            kind: RequestKind::Vacation,
            date,
            hours: 0,
            status,
            comment: None,
        }
    }

    #[test]
    fn single_absence_is_not_an_overlap() {
        let reqs = vec![req("ana", Role::Functional, day(15), RequestStatus::Approved)];
        assert!(!detect_overlap(&reqs, day(15), Role::Functional, &OverlapPolicy::default()));
    }

    #[test]
    fn two_committed_same_role_same_day_overlap() {
        let reqs = vec![
            req("ana", Role::Functional, day(15), RequestStatus::Approved),
            req("luis", Role::Functional, day(15), RequestStatus::Overlapping),
        ];
        let policy = OverlapPolicy::default();
        assert!(detect_overlap(&reqs, day(15), Role::Functional, &policy));
        let ids = conflicting_ids(&reqs, day(15), Role::Functional, &policy);
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn pending_and_rejected_are_ignored() {
        let reqs = vec![
            req("ana", Role::Functional, day(15), RequestStatus::Approved),
            req("luis", Role::Functional, day(15), RequestStatus::Pending),
            req("eva", Role::Functional, day(15), RequestStatus::Rejected),
        ];
        assert!(!detect_overlap(&reqs, day(15), Role::Functional, &OverlapPolicy::default()));
    }

    #[test]
    fn different_role_or_day_does_not_count() {
        let reqs = vec![
            req("ana", Role::Functional, day(15), RequestStatus::Approved),
            req("luis", Role::Integration, day(15), RequestStatus::Approved),
            req("eva", Role::Functional, day(16), RequestStatus::Approved),
        ];
        let policy = OverlapPolicy::default();
        assert!(!detect_overlap(&reqs, day(15), Role::Functional, &policy));
        assert!(conflicting_ids(&reqs, day(16), Role::Functional, &policy).is_empty());
    }

    #[test]
    fn conflicts_are_symmetric() {
        let reqs = vec![
            req("ana", Role::Deployment, day(3), RequestStatus::Approved),
            req("luis", Role::Deployment, day(3), RequestStatus::Approved),
            req("eva", Role::Deployment, day(4), RequestStatus::Approved),
        ];
        let policy = OverlapPolicy::default();
        for a in &reqs {
            for b in &reqs {
                let a_sees_b = conflicting_ids(&reqs, a.date, a.role, &policy).contains(&b.id);
                let b_sees_a = conflicting_ids(&reqs, b.date, b.role, &policy).contains(&a.id);
                assert_eq!(a_sees_b, b_sees_a);
            }
        }
    }

    #[test]
    fn per_role_threshold_overrides_default() {
        let reqs = vec![
            req("ana", Role::Functional, day(15), RequestStatus::Approved),
            req("luis", Role::Functional, day(15), RequestStatus::Approved),
        ];
        let policy = OverlapPolicy::default().with_role_threshold(Role::Functional, 2);
        assert!(!detect_overlap(&reqs, day(15), Role::Functional, &policy));
        assert_eq!(policy.threshold_for(Role::Integration), 1);

        let strict = OverlapPolicy::with_threshold(0);
        assert!(detect_overlap(&reqs[..1], day(15), Role::Functional, &strict));
    }

    #[test]
    fn candidate_is_counted_as_committed() {
        let approved = req("ana", Role::Functional, day(15), RequestStatus::Approved);
        let candidate = req("luis", Role::Functional, day(15), RequestStatus::Pending);
        let reqs = vec![approved.clone(), candidate.clone()];

        let verdict = evaluate_candidate(&reqs, &candidate, &OverlapPolicy::default());
        assert!(verdict.conflict);
        assert_eq!(verdict.status(), RequestStatus::Overlapping);
        assert_eq!(verdict.others, vec![approved.id]);

        let alone = evaluate_candidate(&reqs[1..], &candidate, &OverlapPolicy::default());
        assert_eq!(alone.status(), RequestStatus::Approved);
        assert!(alone.others.is_empty());
    }

    #[test]
    fn report_names_coinciding_members() {
        let reqs = vec![
            req("ana", Role::Functional, day(15), RequestStatus::Overlapping),
            req("luis", Role::Functional, day(15), RequestStatus::Overlapping),
            req("eva", Role::Functional, day(15), RequestStatus::Pending),
            req("tom", Role::Integration, day(15), RequestStatus::Approved),
        ];
        let report = overlap_report(&reqs, &OverlapPolicy::default());
        assert_eq!(report.len(), 2);
        let ana = report.iter().find(|c| c.member == "ana").unwrap();
        assert_eq!(ana.coincides_with, vec!["luis".to_string()]);
        assert_eq!(ana.role, Role::Functional);
    }

    #[test]
    fn parse_role_thresholds() {
        let map = OverlapPolicy::parse_role_thresholds("functional=2, project lead=0").unwrap();
        assert_eq!(map.get(&Role::Functional), Some(&2));
        assert_eq!(map.get(&Role::ProjectLead), Some(&0));
        assert!(OverlapPolicy::parse_role_thresholds("functional").is_err());
        assert!(OverlapPolicy::parse_role_thresholds("chef=1").is_err());
        assert!(OverlapPolicy::parse_role_thresholds("").unwrap().is_empty());
    }
}
