use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    address::{serde_amount, Address, Amount, RewardId},
    config::GenesisConfig,
    factory::RoomFactory,
    room::{CallContext, RoomCall, RoomError, RoomEvent, RoomLedger, Transfer},
};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("no live room at {0}")]
    UnknownRoom(Address),
    #[error(
        "insufficient funds in account {account}: requested {requested}, available {available}"
    )]
    InsufficientFunds {
        account: Address,
        requested: Amount,
        available: Amount,
    },
    #[error("recipient {0} does not accept plain transfers")]
    RecipientRejected(Address),
    #[error("reverted: {0}")]
    Room(#[from] RoomError),
}

impl ChainError {
    /// The room-level reason, when the room itself rejected the call.
    pub fn room_error(&self) -> Option<&RoomError> {
        match self {
            ChainError::Room(err) => Some(err),
            _ => None,
        }
    }
}

/// A call against a deployed room.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    #[serde(default, with = "serde_amount")]
    pub value: Amount,
    pub call: RoomCall,
}

impl Transaction {
    pub fn new(from: Address, to: Address, call: RoomCall) -> Self {
        Self {
            from,
            to,
            value: 0,
            call,
        }
    }

    pub fn with_value(mut self, value: Amount) -> Self {
        self.value = value;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub height: u64,
    pub emitter: Address,
    pub event: RoomEvent,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub height: u64,
    pub room: Address,
    pub events: Vec<RoomEvent>,
    pub transfers: Vec<Transfer>,
    pub destroyed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomView {
    pub owner: Address,
    #[serde(with = "serde_amount")]
    pub balance: Amount,
    pub paused: bool,
    pub active: bool,
    pub used_reward_ids: Vec<RewardId>,
}

impl From<&RoomLedger> for RoomView {
    fn from(room: &RoomLedger) -> Self {
        Self {
            owner: room.owner(),
            balance: room.balance(),
            paused: room.is_paused(),
            active: room.is_active(),
            used_reward_ids: room.used_reward_ids(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainSnapshot {
    pub height: u64,
    pub factory: Address,
    pub accounts: BTreeMap<Address, String>,
    pub rooms: BTreeMap<Address, RoomView>,
    pub destroyed: Vec<Address>,
    pub log: Vec<LogEntry>,
    #[serde(with = "hex_root")]
    pub state_root: [u8; 32],
}

/// In-process host that executes room transactions one at a time.
///
/// Every transaction is all-or-nothing: the room runs on a working copy and
/// balances, room state, and the log are committed only when the whole call
/// (including its outgoing transfers) is valid.
#[derive(Clone, Debug)]
pub struct Chain {
    factory: RoomFactory,
    accounts: BTreeMap<Address, Amount>,
    rooms: BTreeMap<Address, RoomLedger>,
    destroyed: BTreeSet<Address>,
    log: Vec<LogEntry>,
    height: u64,
}

impl Chain {
    pub fn new(factory: Address) -> Self {
        Self {
            factory: RoomFactory::new(factory),
            accounts: BTreeMap::new(),
            rooms: BTreeMap::new(),
            destroyed: BTreeSet::new(),
            log: Vec::new(),
            height: 0,
        }
    }

    pub fn from_genesis(config: &GenesisConfig) -> Self {
        let mut chain = Self::new(config.factory_address());
        for account in &config.accounts {
            chain.credit_account(&account.address(), account.balance);
        }
        chain
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn factory(&self) -> &RoomFactory {
        &self.factory
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn room(&self, address: &Address) -> Option<&RoomLedger> {
        self.rooms.get(address)
    }

    pub fn is_destroyed(&self, address: &Address) -> bool {
        self.destroyed.contains(address)
    }

    /// Native balance of an account or of a live room.
    pub fn balance_of(&self, address: &Address) -> Amount {
        if let Some(room) = self.rooms.get(address) {
            return room.balance();
        }
        self.accounts.get(address).copied().unwrap_or(0)
    }

    /// Sum of every account and room balance. Constant across transactions.
    pub fn total_supply(&self) -> Amount {
        let accounts: Amount = self.accounts.values().sum();
        let rooms: Amount = self.rooms.values().map(RoomLedger::balance).sum();
        accounts + rooms
    }

    pub fn credit_account(&mut self, account: &Address, amount: Amount) {
        *self.accounts.entry(*account).or_default() += amount;
    }

    pub fn debit_account(&mut self, account: &Address, amount: Amount) -> Result<(), ChainError> {
        self.ensure_funds(account, amount)?;
        if let Some(balance) = self.accounts.get_mut(account) {
            *balance -= amount;
        }
        Ok(())
    }

    /// Deploys a room through the factory, funded from `from`.
    pub fn create_room(&mut self, from: Address, value: Amount) -> Result<Receipt, ChainError> {
        self.ensure_funds(&from, value)?;
        let deployment = self
            .factory
            .create_room(&CallContext::new(from, value))
            .inspect_err(|err| tracing::warn!(%from, error = %err, "room creation reverted"))?;
        self.debit_account(&from, value)?;

        let height = self.next_height();
        self.rooms.insert(deployment.address, deployment.room);
        self.log.push(LogEntry {
            height,
            emitter: self.factory.address(),
            event: deployment.event.clone(),
        });
        tracing::info!(room = %deployment.address, owner = %from, value = %value, "room created");
        Ok(Receipt {
            height,
            room: deployment.address,
            events: vec![deployment.event],
            transfers: vec![],
            destroyed: false,
        })
    }

    pub fn execute(&mut self, tx: &Transaction) -> Result<Receipt, ChainError> {
        let result = self.try_execute(tx);
        match &result {
            Ok(receipt) => tracing::debug!(
                room = %tx.to,
                call = tx.call.name(),
                height = receipt.height,
                events = receipt.events.len(),
                "transaction applied"
            ),
            Err(err) => tracing::warn!(
                room = %tx.to,
                from = %tx.from,
                call = tx.call.name(),
                error = %err,
                "transaction reverted"
            ),
        }
        result
    }

    fn try_execute(&mut self, tx: &Transaction) -> Result<Receipt, ChainError> {
        let mut room = self
            .rooms
            .get(&tx.to)
            .cloned()
            .ok_or(ChainError::UnknownRoom(tx.to))?;
        self.ensure_funds(&tx.from, tx.value)?;

        let ctx = CallContext::new(tx.from, tx.value);
        let outcome = room.dispatch(&ctx, &tx.call)?;
        for transfer in &outcome.transfers {
            if self.rooms.contains_key(&transfer.to) {
                return Err(ChainError::RecipientRejected(transfer.to));
            }
        }

        // Nothing below can fail.
        self.debit_account(&tx.from, tx.value)?;
        for transfer in &outcome.transfers {
            self.credit_account(&transfer.to, transfer.amount);
        }
        if outcome.destroyed {
            self.rooms.remove(&tx.to);
            self.destroyed.insert(tx.to);
            tracing::info!(room = %tx.to, "room destroyed");
        } else {
            self.rooms.insert(tx.to, room);
        }

        let height = self.next_height();
        for event in &outcome.events {
            self.log.push(LogEntry {
                height,
                emitter: tx.to,
                event: event.clone(),
            });
        }
        Ok(Receipt {
            height,
            room: tx.to,
            events: outcome.events,
            transfers: outcome.transfers,
            destroyed: outcome.destroyed,
        })
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        let rooms: BTreeMap<Address, RoomView> = self
            .rooms
            .iter()
            .map(|(address, room)| (*address, RoomView::from(room)))
            .collect();
        ChainSnapshot {
            height: self.height,
            factory: self.factory.address(),
            accounts: self
                .accounts
                .iter()
                .map(|(address, balance)| (*address, balance.to_string()))
                .collect(),
            state_root: compute_state_root(&self.accounts, &rooms),
            rooms,
            destroyed: self.destroyed.iter().copied().collect(),
            log: self.log.clone(),
        }
    }

    fn ensure_funds(&self, account: &Address, amount: Amount) -> Result<(), ChainError> {
        let available = self.accounts.get(account).copied().unwrap_or(0);
        if available < amount {
            return Err(ChainError::InsufficientFunds {
                account: *account,
                requested: amount,
                available,
            });
        }
        Ok(())
    }

    fn next_height(&mut self) -> u64 {
        self.height += 1;
        self.height
    }
}

/// Cloneable handle that serializes every access through a single lock.
#[derive(Clone, Debug)]
pub struct SharedChain {
    inner: Arc<Mutex<Chain>>,
}

impl SharedChain {
    pub fn new(chain: Chain) -> Self {
        Self {
            inner: Arc::new(Mutex::new(chain)),
        }
    }

    pub fn execute(&self, tx: &Transaction) -> Result<Receipt, ChainError> {
        self.with_mut(|chain| chain.execute(tx))
    }

    pub fn create_room(&self, from: Address, value: Amount) -> Result<Receipt, ChainError> {
        self.with_mut(|chain| chain.create_room(from, value))
    }

    pub fn with<R>(&self, f: impl FnOnce(&Chain) -> R) -> R {
        let chain = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&chain)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Chain) -> R) -> R {
        let mut chain = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut chain)
    }
}

fn compute_state_root(
    accounts: &BTreeMap<Address, Amount>,
    rooms: &BTreeMap<Address, RoomView>,
) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::new();
    for (address, balance) in accounts {
        let mut hasher = Sha256::new();
        hasher.update(b"acct");
        hasher.update(address.as_bytes());
        hasher.update(balance.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    for (address, room) in rooms {
        let mut hasher = Sha256::new();
        hasher.update(b"room");
        hasher.update(address.as_bytes());
        hasher.update(room.owner.as_bytes());
        hasher.update(room.balance.to_le_bytes());
        hasher.update([room.paused as u8, room.active as u8]);
        for id in &room.used_reward_ids {
            hasher.update(id.to_le_bytes());
        }
        leaves.push(hasher.finalize().into());
    }
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"room-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len().div_ceil(2));
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

mod hex_root {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("state root must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::UNIT;

    fn addr(label: &str) -> Address {
        Address::from_label(label)
    }

    fn chain() -> Chain {
        Chain::from_genesis(&GenesisConfig::default())
    }

    #[test]
    fn create_room_moves_value_from_creator() {
        let mut chain = chain();
        let supply = chain.total_supply();
        let receipt = chain.create_room(addr("owner"), UNIT).unwrap();
        assert_eq!(chain.balance_of(&receipt.room), UNIT);
        assert_eq!(chain.balance_of(&addr("owner")), 99 * UNIT);
        assert_eq!(chain.total_supply(), supply);
        assert_eq!(
            chain.log()[0].event,
            RoomEvent::RoomCreated {
                room: receipt.room,
                owner: addr("owner")
            }
        );
        assert_eq!(chain.log()[0].emitter, chain.factory().address());
    }

    #[test]
    fn create_room_rejects_unfunded_creator() {
        let mut chain = chain();
        let err = chain.create_room(addr("nobody"), 1).unwrap_err();
        assert!(matches!(err, ChainError::InsufficientFunds { .. }));
        assert_eq!(
            chain.create_room(addr("owner"), 0).unwrap_err(),
            ChainError::Room(RoomError::ZeroValue)
        );
        assert_eq!(chain.height(), 0);
        assert!(chain.log().is_empty());
    }

    #[test]
    fn reward_credits_recipient_and_logs_event() {
        let mut chain = chain();
        let room = chain.create_room(addr("owner"), UNIT).unwrap().room;
        let tx = Transaction::new(
            addr("owner"),
            room,
            RoomCall::SendReward {
                amount: UNIT / 2,
                recipient: addr("dave"),
                reward_id: 1,
            },
        );
        let receipt = chain.execute(&tx).unwrap();
        assert_eq!(receipt.height, 2);
        assert_eq!(chain.balance_of(&addr("dave")), UNIT / 2);
        assert_eq!(chain.balance_of(&room), UNIT / 2);
        assert_eq!(chain.log().len(), 2);
        assert_eq!(chain.log()[1].emitter, room);
    }

    #[test]
    fn reverted_transaction_changes_nothing() {
        let mut chain = chain();
        let room = chain.create_room(addr("owner"), UNIT).unwrap().room;
        let before = chain.snapshot();
        let tx = Transaction::new(addr("alice"), room, RoomCall::Pause);
        let err = chain.execute(&tx).unwrap_err();
        assert_eq!(
            err.room_error(),
            Some(&RoomError::Unauthorized { caller: addr("alice") })
        );
        assert_eq!(chain.snapshot(), before);
    }

    #[test]
    fn deposit_beyond_sender_funds_fails() {
        let mut chain = chain();
        let room = chain.create_room(addr("owner"), UNIT).unwrap().room;
        let tx = Transaction::new(addr("alice"), room, RoomCall::Deposit).with_value(1_000 * UNIT);
        assert!(matches!(
            chain.execute(&tx),
            Err(ChainError::InsufficientFunds { .. })
        ));
        assert_eq!(chain.balance_of(&room), UNIT);
    }

    #[test]
    fn transfer_into_a_room_aborts_whole_call() {
        let mut chain = chain();
        let first = chain.create_room(addr("owner"), UNIT).unwrap().room;
        let second = chain.create_room(addr("owner"), UNIT).unwrap().room;
        let before = chain.snapshot();
        let tx = Transaction::new(
            addr("owner"),
            first,
            RoomCall::SendReward {
                amount: 1,
                recipient: second,
                reward_id: 1,
            },
        );
        assert_eq!(
            chain.execute(&tx).unwrap_err(),
            ChainError::RecipientRejected(second)
        );
        assert_eq!(chain.snapshot(), before);
        assert!(!chain.room(&first).unwrap().is_reward_id_used(1));
    }

    #[test]
    fn destroyed_room_is_gone() {
        let mut chain = chain();
        let owner = addr("owner");
        let room = chain.create_room(owner, UNIT).unwrap().room;
        chain
            .execute(&Transaction::new(owner, room, RoomCall::Pause))
            .unwrap();
        let receipt = chain
            .execute(&Transaction::new(
                owner,
                room,
                RoomCall::DestroyAndSend {
                    recipient: addr("carol"),
                },
            ))
            .unwrap();
        assert!(receipt.destroyed);
        assert!(chain.is_destroyed(&room));
        assert_eq!(chain.balance_of(&addr("carol")), 101 * UNIT);
        assert_eq!(
            chain
                .execute(&Transaction::new(owner, room, RoomCall::Unpause))
                .unwrap_err(),
            ChainError::UnknownRoom(room)
        );
    }

    #[test]
    fn state_root_tracks_state() {
        let mut a = chain();
        let b = chain();
        assert_eq!(a.snapshot().state_root, b.snapshot().state_root);
        a.create_room(addr("owner"), UNIT).unwrap();
        assert_ne!(a.snapshot().state_root, b.snapshot().state_root);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let mut chain = chain();
        chain.create_room(addr("owner"), UNIT).unwrap();
        let snapshot = chain.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: ChainSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn shared_chain_serializes_threads() {
        let shared = SharedChain::new(chain());
        let room = shared.create_room(addr("owner"), UNIT).unwrap().room;
        let handles: Vec<_> = ["alice", "bob", "carol"]
            .into_iter()
            .map(|label| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let tx =
                            Transaction::new(addr(label), room, RoomCall::Deposit).with_value(1);
                        shared.execute(&tx).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.with(|chain| chain.balance_of(&room)), UNIT + 30);
        assert_eq!(shared.with(Chain::height), 31);
    }
}
