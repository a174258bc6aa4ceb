use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

pub(super) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidRequest("member name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("member name too long"));
    }
    Ok(())
}

/// Fails unless `member` can cover `amount` of `kind`.
pub(super) fn ensure_available(
    member: &Member,
    kind: RequestKind,
    amount: u32,
) -> Result<(), EngineError> {
    let available = member.balance(kind).unwrap_or(u32::MAX);
    if available < amount {
        return Err(EngineError::InsufficientBalance {
            member: member.name.clone(),
            kind,
            available,
            requested: amount,
        });
    }
    Ok(())
}

impl Engine {
    /// Register a member or overwrite an existing one (keyed by name).
    pub async fn add_or_update_member(
        &self,
        name: &str,
        role: Role,
        vacation_balance: u32,
        hour_balance: u32,
    ) -> Result<(), EngineError> {
        validate_name(name)?;
        if vacation_balance > MAX_BALANCE || hour_balance > MAX_BALANCE {
            return Err(EngineError::LimitExceeded("balance too large"));
        }

        let mut store = self.store.write().await;
        let existing = store.member(name).is_some();
        if existing && self.config.reject_duplicate_members {
            debug!("refusing to re-register {name}");
            return Err(EngineError::DuplicateMember(name.to_string()));
        }
        if !existing && store.member_count() >= MAX_MEMBERS {
            return Err(EngineError::LimitExceeded("too many members"));
        }

        let event = Event::MemberUpserted {
            name: name.to_string(),
            role,
            vacation_balance,
            hour_balance,
        };
        self.persist_and_apply(&mut store, event).await?;
        info!(
            "{} member {name} ({role}): {vacation_balance} days, {hour_balance} hours",
            if existing { "updated" } else { "registered" }
        );
        Ok(())
    }

    /// Remove a member. Their requests stay in the ledger. Returns whether
    /// anything was removed; unknown names are a no-op.
    pub async fn remove_member(&self, name: &str) -> Result<bool, EngineError> {
        let mut store = self.store.write().await;
        if store.member(name).is_none() {
            debug!("remove_member: {name} not registered");
            return Ok(false);
        }
        let event = Event::MemberRemoved { name: name.to_string() };
        self.persist_and_apply(&mut store, event).await?;
        info!("removed member {name}");
        Ok(true)
    }

    pub async fn get_member(&self, name: &str) -> Result<Member, EngineError> {
        self.store
            .read()
            .await
            .member(name)
            .cloned()
            .ok_or_else(|| EngineError::MemberNotFound(name.to_string()))
    }

    pub async fn list_members(&self) -> Vec<Member> {
        self.store.read().await.members().cloned().collect()
    }

    /// Administrative debit outside the approval flow. Fails without touching
    /// the balance when it cannot cover `amount`.
    pub async fn debit(
        &self,
        name: &str,
        kind: RequestKind,
        amount: u32,
    ) -> Result<Member, EngineError> {
        let mut store = self.store.write().await;
        let member = store
            .member(name)
            .ok_or_else(|| EngineError::MemberNotFound(name.to_string()))?;
        ensure_available(member, kind, amount)?;

        let event = Event::BalanceDebited {
            name: name.to_string(),
            kind,
            amount,
        };
        self.persist_and_apply(&mut store, event).await?;
        let member = store
            .member(name)
            .cloned()
            .ok_or_else(|| EngineError::MemberNotFound(name.to_string()))?;
        info!("debited {amount} {kind} from {name}");
        Ok(member)
    }
}
