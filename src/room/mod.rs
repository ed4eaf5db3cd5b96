use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::address::{serde_amount, Address, Amount, RewardId};

/// Call-scoped inputs the host supplies with every room operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallContext {
    pub caller: Address,
    pub value: Amount,
}

impl CallContext {
    pub fn new(caller: Address, value: Amount) -> Self {
        Self { caller, value }
    }

    /// A call carrying no value.
    pub fn sender(caller: Address) -> Self {
        Self { caller, value: 0 }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("caller {caller} is not the room owner")]
    Unauthorized { caller: Address },
    #[error("operation does not accept value, got {value}")]
    NonPayable { value: Amount },
    #[error("room is paused")]
    Paused,
    #[error("room is not paused")]
    NotPaused,
    #[error("room is already paused")]
    AlreadyPaused,
    #[error("room is active")]
    Active,
    #[error("room is already active")]
    AlreadyActive,
    #[error("room is not active")]
    NotActive,
    #[error("attached value must be greater than zero")]
    ZeroValue,
    #[error("amount must be greater than zero")]
    ZeroAmount,
    #[error("recipient must not be the zero address")]
    InvalidRecipient,
    #[error("reward id {0} has already been used")]
    RewardIdUsed(RewardId),
    #[error("insufficient room balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Amount, available: Amount },
    #[error("nothing to refund")]
    NothingToRefund,
    #[error("deposit of {value} would overflow room balance {balance}")]
    BalanceOverflow { balance: Amount, value: Amount },
}

impl RoomError {
    pub fn is_authorization(&self) -> bool {
        matches!(self, RoomError::Unauthorized { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    RoomCreated {
        room: Address,
        owner: Address,
    },
    Deposited {
        depositor: Address,
        #[serde(with = "serde_amount")]
        amount: Amount,
    },
    RewardSent {
        #[serde(with = "serde_amount")]
        amount: Amount,
        destination: Address,
    },
    RefundedToOwner {
        #[serde(with = "serde_amount")]
        amount: Amount,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomCall {
    Deposit,
    SendReward {
        #[serde(with = "serde_amount")]
        amount: Amount,
        recipient: Address,
        reward_id: RewardId,
    },
    Pause,
    Unpause,
    Activate,
    Deactivate,
    RefundToOwner,
    Destroy,
    DestroyAndSend {
        recipient: Address,
    },
}

impl RoomCall {
    pub fn name(&self) -> &'static str {
        match self {
            RoomCall::Deposit => "deposit",
            RoomCall::SendReward { .. } => "send_reward",
            RoomCall::Pause => "pause",
            RoomCall::Unpause => "unpause",
            RoomCall::Activate => "activate",
            RoomCall::Deactivate => "deactivate",
            RoomCall::RefundToOwner => "refund_to_owner",
            RoomCall::Destroy => "destroy",
            RoomCall::DestroyAndSend { .. } => "destroy_and_send",
        }
    }
}

/// Native value leaving the room as a side effect of a call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transfer {
    pub to: Address,
    #[serde(with = "serde_amount")]
    pub amount: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CallOutcome {
    pub events: Vec<RoomEvent>,
    pub transfers: Vec<Transfer>,
    pub destroyed: bool,
}

impl CallOutcome {
    fn event(event: RoomEvent) -> Self {
        Self {
            events: vec![event],
            ..Self::default()
        }
    }

    fn empty() -> Self {
        Self::default()
    }
}

/// Single-owner value-holding account with pause and activation gates.
///
/// Every operation validates all of its preconditions before touching state,
/// so a returned error always means nothing changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomLedger {
    owner: Address,
    balance: Amount,
    paused: bool,
    active: bool,
    used_reward_ids: HashSet<RewardId>,
}

impl RoomLedger {
    pub fn new(owner: Address, initial_deposit: Amount) -> Self {
        Self {
            owner,
            balance: initial_deposit,
            paused: false,
            active: false,
            used_reward_ids: HashSet::new(),
        }
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_reward_id_used(&self, reward_id: RewardId) -> bool {
        self.used_reward_ids.contains(&reward_id)
    }

    pub fn used_reward_count(&self) -> usize {
        self.used_reward_ids.len()
    }

    /// Used reward ids in ascending order.
    pub fn used_reward_ids(&self) -> Vec<RewardId> {
        let mut ids: Vec<RewardId> = self.used_reward_ids.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn dispatch(
        &mut self,
        ctx: &CallContext,
        call: &RoomCall,
    ) -> Result<CallOutcome, RoomError> {
        match call {
            RoomCall::Deposit => self.deposit(ctx),
            RoomCall::SendReward {
                amount,
                recipient,
                reward_id,
            } => self.send_reward(ctx, *amount, *recipient, *reward_id),
            RoomCall::Pause => self.pause(ctx),
            RoomCall::Unpause => self.unpause(ctx),
            RoomCall::Activate => self.activate(ctx),
            RoomCall::Deactivate => self.deactivate(ctx),
            RoomCall::RefundToOwner => self.refund_to_owner(ctx),
            RoomCall::Destroy => self.destroy(ctx),
            RoomCall::DestroyAndSend { recipient } => self.destroy_and_send(ctx, *recipient),
        }
    }

    pub fn deposit(&mut self, ctx: &CallContext) -> Result<CallOutcome, RoomError> {
        if self.paused {
            return Err(RoomError::Paused);
        }
        if ctx.value == 0 {
            return Err(RoomError::ZeroValue);
        }
        self.balance = self
            .balance
            .checked_add(ctx.value)
            .ok_or(RoomError::BalanceOverflow {
                balance: self.balance,
                value: ctx.value,
            })?;
        Ok(CallOutcome::event(RoomEvent::Deposited {
            depositor: ctx.caller,
            amount: ctx.value,
        }))
    }

    pub fn send_reward(
        &mut self,
        ctx: &CallContext,
        amount: Amount,
        recipient: Address,
        reward_id: RewardId,
    ) -> Result<CallOutcome, RoomError> {
        self.only_owner(ctx)?;
        if amount == 0 {
            return Err(RoomError::ZeroAmount);
        }
        if recipient.is_zero() {
            return Err(RoomError::InvalidRecipient);
        }
        if self.used_reward_ids.contains(&reward_id) {
            return Err(RoomError::RewardIdUsed(reward_id));
        }
        if amount > self.balance {
            return Err(RoomError::InsufficientBalance {
                requested: amount,
                available: self.balance,
            });
        }
        self.balance -= amount;
        self.used_reward_ids.insert(reward_id);
        Ok(CallOutcome {
            events: vec![RoomEvent::RewardSent {
                amount,
                destination: recipient,
            }],
            transfers: vec![Transfer {
                to: recipient,
                amount,
            }],
            destroyed: false,
        })
    }

    pub fn pause(&mut self, ctx: &CallContext) -> Result<CallOutcome, RoomError> {
        self.only_owner(ctx)?;
        if self.paused {
            return Err(RoomError::AlreadyPaused);
        }
        self.paused = true;
        Ok(CallOutcome::empty())
    }

    pub fn unpause(&mut self, ctx: &CallContext) -> Result<CallOutcome, RoomError> {
        self.only_owner(ctx)?;
        if !self.paused {
            return Err(RoomError::NotPaused);
        }
        self.paused = false;
        Ok(CallOutcome::empty())
    }

    pub fn activate(&mut self, ctx: &CallContext) -> Result<CallOutcome, RoomError> {
        self.only_owner(ctx)?;
        if self.active {
            return Err(RoomError::AlreadyActive);
        }
        self.active = true;
        Ok(CallOutcome::empty())
    }

    pub fn deactivate(&mut self, ctx: &CallContext) -> Result<CallOutcome, RoomError> {
        self.only_owner(ctx)?;
        if !self.active {
            return Err(RoomError::NotActive);
        }
        self.active = false;
        Ok(CallOutcome::empty())
    }

    pub fn refund_to_owner(&mut self, ctx: &CallContext) -> Result<CallOutcome, RoomError> {
        self.only_owner(ctx)?;
        if self.active {
            return Err(RoomError::Active);
        }
        if self.balance == 0 {
            return Err(RoomError::NothingToRefund);
        }
        let amount = std::mem::take(&mut self.balance);
        Ok(CallOutcome {
            events: vec![RoomEvent::RefundedToOwner { amount }],
            transfers: vec![Transfer {
                to: self.owner,
                amount,
            }],
            destroyed: false,
        })
    }

    /// Removes the room; whatever it still holds goes back to the owner.
    pub fn destroy(&mut self, ctx: &CallContext) -> Result<CallOutcome, RoomError> {
        self.only_owner(ctx)?;
        if !self.paused {
            return Err(RoomError::NotPaused);
        }
        Ok(self.sweep(self.owner))
    }

    pub fn destroy_and_send(
        &mut self,
        ctx: &CallContext,
        recipient: Address,
    ) -> Result<CallOutcome, RoomError> {
        self.only_owner(ctx)?;
        if !self.paused {
            return Err(RoomError::NotPaused);
        }
        if recipient.is_zero() {
            return Err(RoomError::InvalidRecipient);
        }
        Ok(self.sweep(recipient))
    }

    fn sweep(&mut self, to: Address) -> CallOutcome {
        let amount = std::mem::take(&mut self.balance);
        let transfers = if amount > 0 {
            vec![Transfer { to, amount }]
        } else {
            vec![]
        };
        CallOutcome {
            events: vec![],
            transfers,
            destroyed: true,
        }
    }

    // Authorization first, then value: a non-owner always sees `Unauthorized`.
    fn only_owner(&self, ctx: &CallContext) -> Result<(), RoomError> {
        if ctx.caller != self.owner {
            return Err(RoomError::Unauthorized { caller: ctx.caller });
        }
        if ctx.value > 0 {
            return Err(RoomError::NonPayable { value: ctx.value });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::UNIT;

    fn owner() -> Address {
        Address::from_label("owner")
    }

    fn stranger() -> Address {
        Address::from_label("stranger")
    }

    fn room() -> RoomLedger {
        RoomLedger::new(owner(), UNIT)
    }

    #[test]
    fn new_room_starts_unpaused_and_inactive() {
        let room = room();
        assert_eq!(room.owner(), owner());
        assert_eq!(room.balance(), UNIT);
        assert!(!room.is_paused());
        assert!(!room.is_active());
        assert_eq!(room.used_reward_count(), 0);
    }

    #[test]
    fn deposit_emits_event_and_grows_balance() {
        let mut room = room();
        let outcome = room.deposit(&CallContext::new(stranger(), 5)).unwrap();
        assert_eq!(room.balance(), UNIT + 5);
        assert_eq!(
            outcome.events,
            vec![RoomEvent::Deposited {
                depositor: stranger(),
                amount: 5
            }]
        );
        assert!(outcome.transfers.is_empty());
    }

    #[test]
    fn deposit_rejects_zero_and_paused() {
        let mut room = room();
        assert_eq!(
            room.deposit(&CallContext::sender(stranger())),
            Err(RoomError::ZeroValue)
        );
        room.pause(&CallContext::sender(owner())).unwrap();
        assert_eq!(
            room.deposit(&CallContext::new(owner(), 1)),
            Err(RoomError::Paused)
        );
        assert_eq!(room.balance(), UNIT);
    }

    #[test]
    fn deposit_overflowing_balance_is_rejected() {
        let mut room = room();
        let whale = CallContext::new(stranger(), u128::MAX);
        assert_eq!(
            room.deposit(&whale),
            Err(RoomError::BalanceOverflow {
                balance: UNIT,
                value: u128::MAX
            })
        );
        assert_eq!(room.balance(), UNIT);
        room.deposit(&CallContext::new(stranger(), u128::MAX - UNIT)).unwrap();
        assert_eq!(room.balance(), u128::MAX);
    }

    #[test]
    fn non_owner_is_unauthorized_before_any_other_check() {
        let mut room = room();
        let ctx = CallContext::new(stranger(), 7);
        let err = room.send_reward(&ctx, 0, Address::ZERO, 1).unwrap_err();
        assert!(err.is_authorization());
        for call in [
            RoomCall::Pause,
            RoomCall::Unpause,
            RoomCall::Activate,
            RoomCall::Deactivate,
            RoomCall::RefundToOwner,
            RoomCall::Destroy,
            RoomCall::DestroyAndSend {
                recipient: Address::ZERO,
            },
        ] {
            let err = room.dispatch(&ctx, &call).unwrap_err();
            assert_eq!(
                err,
                RoomError::Unauthorized { caller: stranger() },
                "{}",
                call.name()
            );
        }
        assert_eq!(room, self::room());
    }

    #[test]
    fn owner_calls_reject_attached_value() {
        let mut room = room();
        let err = room.pause(&CallContext::new(owner(), 1)).unwrap_err();
        assert_eq!(err, RoomError::NonPayable { value: 1 });
        assert!(!room.is_paused());
    }

    #[test]
    fn send_reward_validates_and_records_id() {
        let mut room = room();
        let ctx = CallContext::sender(owner());
        let dest = stranger();
        assert_eq!(room.send_reward(&ctx, 0, dest, 1), Err(RoomError::ZeroAmount));
        assert_eq!(
            room.send_reward(&ctx, 1, Address::ZERO, 1),
            Err(RoomError::InvalidRecipient)
        );
        assert_eq!(
            room.send_reward(&ctx, UNIT + 1, dest, 1),
            Err(RoomError::InsufficientBalance {
                requested: UNIT + 1,
                available: UNIT
            })
        );
        assert!(!room.is_reward_id_used(1));

        let outcome = room.send_reward(&ctx, UNIT / 2, dest, 1).unwrap();
        assert_eq!(room.balance(), UNIT / 2);
        assert_eq!(
            outcome.transfers,
            vec![Transfer {
                to: dest,
                amount: UNIT / 2
            }]
        );
        assert_eq!(
            outcome.events,
            vec![RoomEvent::RewardSent {
                amount: UNIT / 2,
                destination: dest
            }]
        );
        assert!(room.is_reward_id_used(1));
    }

    #[test]
    fn reward_id_is_never_reusable() {
        let mut room = room();
        let ctx = CallContext::sender(owner());
        room.send_reward(&ctx, 1, stranger(), 9).unwrap();
        assert_eq!(
            room.send_reward(&ctx, 2, owner(), 9),
            Err(RoomError::RewardIdUsed(9))
        );
        // zero amount and replay each reject on their own
        assert_eq!(room.send_reward(&ctx, 0, stranger(), 10), Err(RoomError::ZeroAmount));
        assert_eq!(room.used_reward_ids(), vec![9]);
    }

    #[test]
    fn reward_may_drain_entire_balance() {
        let mut room = room();
        let ctx = CallContext::sender(owner());
        room.send_reward(&ctx, UNIT, stranger(), 1).unwrap();
        assert_eq!(room.balance(), 0);
    }

    #[test]
    fn redundant_toggles_fail_without_change() {
        let mut room = room();
        let ctx = CallContext::sender(owner());
        assert_eq!(room.unpause(&ctx), Err(RoomError::NotPaused));
        assert_eq!(room.deactivate(&ctx), Err(RoomError::NotActive));
        room.pause(&ctx).unwrap();
        assert_eq!(room.pause(&ctx), Err(RoomError::AlreadyPaused));
        room.activate(&ctx).unwrap();
        assert_eq!(room.activate(&ctx), Err(RoomError::AlreadyActive));
        assert!(room.is_paused());
        assert!(room.is_active());
    }

    #[test]
    fn refund_requires_inactive_and_funds() {
        let mut room = room();
        let ctx = CallContext::sender(owner());
        room.activate(&ctx).unwrap();
        assert_eq!(room.refund_to_owner(&ctx), Err(RoomError::Active));
        room.deactivate(&ctx).unwrap();

        let outcome = room.refund_to_owner(&ctx).unwrap();
        assert_eq!(outcome.events, vec![RoomEvent::RefundedToOwner { amount: UNIT }]);
        assert_eq!(
            outcome.transfers,
            vec![Transfer {
                to: owner(),
                amount: UNIT
            }]
        );
        assert_eq!(room.balance(), 0);
        assert_eq!(room.refund_to_owner(&ctx), Err(RoomError::NothingToRefund));

        room.deposit(&CallContext::new(stranger(), 3)).unwrap();
        room.refund_to_owner(&ctx).unwrap();
    }

    #[test]
    fn destroy_requires_pause() {
        let mut room = room();
        let ctx = CallContext::sender(owner());
        assert_eq!(room.destroy(&ctx), Err(RoomError::NotPaused));
        assert_eq!(
            room.destroy_and_send(&ctx, stranger()),
            Err(RoomError::NotPaused)
        );
        room.pause(&ctx).unwrap();
        let outcome = room.destroy(&ctx).unwrap();
        assert!(outcome.destroyed);
        assert_eq!(
            outcome.transfers,
            vec![Transfer {
                to: owner(),
                amount: UNIT
            }]
        );
        assert_eq!(room.balance(), 0);
    }

    #[test]
    fn destroy_and_send_forwards_to_recipient() {
        let mut room = room();
        let ctx = CallContext::sender(owner());
        room.pause(&ctx).unwrap();
        assert_eq!(
            room.destroy_and_send(&ctx, Address::ZERO),
            Err(RoomError::InvalidRecipient)
        );
        let outcome = room.destroy_and_send(&ctx, stranger()).unwrap();
        assert!(outcome.destroyed);
        assert_eq!(
            outcome.transfers,
            vec![Transfer {
                to: stranger(),
                amount: UNIT
            }]
        );
    }

    #[test]
    fn empty_room_destroys_without_transfers() {
        let mut room = room();
        let ctx = CallContext::sender(owner());
        room.refund_to_owner(&ctx).unwrap();
        room.pause(&ctx).unwrap();
        let outcome = room.destroy(&ctx).unwrap();
        assert!(outcome.destroyed);
        assert!(outcome.transfers.is_empty());
    }

    #[test]
    fn calls_serialize_with_type_tag() {
        let call = RoomCall::SendReward {
            amount: 5,
            recipient: stranger(),
            reward_id: 3,
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "send_reward");
        assert_eq!(json["amount"], "5");
        assert_eq!(json["reward_id"], 3);
        let back: RoomCall = serde_json::from_value(json).unwrap();
        assert_eq!(back, call);
    }
}
