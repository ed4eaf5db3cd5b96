//! Seeded random workload against a single room with invariant checks after
//! every transaction. Same seed, same run.

use std::collections::{BTreeMap, HashSet};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    address::{serde_amount, Address, Amount, RewardId, UNIT},
    chain::{Chain, ChainError, Receipt, Transaction},
    config::GenesisConfig,
    room::{RoomCall, RoomEvent},
};

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub seed: u64,
    pub steps: usize,
    /// Reward ids are drawn from `0..reward_id_space`; small spaces force replays.
    pub reward_id_space: RewardId,
    pub initial_deposit: Amount,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            steps: 1_000,
            reward_id_space: 64,
            initial_deposit: UNIT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("genesis has no accounts")]
    NoAccounts,
    #[error("could not deploy room: {0}")]
    Deploy(#[source] ChainError),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CallStats {
    pub applied: usize,
    pub reverted: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimulationReport {
    pub seed: u64,
    pub steps: usize,
    pub rooms_deployed: usize,
    pub calls: BTreeMap<String, CallStats>,
    #[serde(with = "serde_amount")]
    pub final_room_balance: Amount,
    pub violations: Vec<String>,
}

impl SimulationReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Expected room state, rebuilt from receipts alone.
#[derive(Default)]
struct RoomModel {
    balance: Amount,
    used_reward_ids: HashSet<RewardId>,
}

impl RoomModel {
    fn funded(balance: Amount) -> Self {
        Self {
            balance,
            ..Self::default()
        }
    }

    fn apply(&mut self, call: &RoomCall, receipt: &Receipt) -> Result<(), String> {
        if let RoomCall::SendReward { reward_id, .. } = call {
            if !self.used_reward_ids.insert(*reward_id) {
                return Err(format!("reward id {reward_id} paid twice"));
            }
        }
        for event in &receipt.events {
            match event {
                RoomEvent::Deposited { amount, .. } => self.balance += amount,
                RoomEvent::RewardSent { amount, .. } => {
                    self.balance = self
                        .balance
                        .checked_sub(*amount)
                        .ok_or_else(|| format!("reward of {amount} exceeds modelled balance"))?;
                }
                RoomEvent::RefundedToOwner { amount } => {
                    if *amount != self.balance {
                        return Err(format!(
                            "refund of {amount} differs from modelled balance {}",
                            self.balance
                        ));
                    }
                    self.balance = 0;
                }
                RoomEvent::RoomCreated { .. } => {}
            }
        }
        if receipt.destroyed {
            self.balance = 0;
        }
        Ok(())
    }
}

pub struct Simulation {
    config: SimulationConfig,
    rng: StdRng,
    chain: Chain,
    accounts: Vec<Address>,
    owner: Address,
}

impl Simulation {
    pub fn new(genesis: &GenesisConfig, config: SimulationConfig) -> Result<Self, SimulationError> {
        let accounts: Vec<Address> = genesis.accounts.iter().map(|a| a.address()).collect();
        let owner = *accounts.first().ok_or(SimulationError::NoAccounts)?;
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            chain: Chain::from_genesis(genesis),
            config,
            accounts,
            owner,
        })
    }

    pub fn run(mut self) -> Result<SimulationReport, SimulationError> {
        let supply = self.chain.total_supply();
        let mut room = self.deploy()?;
        let mut model = RoomModel::funded(self.config.initial_deposit);
        let mut rooms_deployed = 1;
        let mut calls: BTreeMap<String, CallStats> = BTreeMap::new();
        let mut violations = Vec::new();

        for step in 0..self.config.steps {
            let tx = self.random_transaction(room);
            let stats = calls.entry(tx.call.name().to_string()).or_default();
            match self.chain.execute(&tx) {
                Ok(receipt) => {
                    stats.applied += 1;
                    if let Err(violation) = model.apply(&tx.call, &receipt) {
                        violations.push(format!("step {step}: {violation}"));
                    }
                    if receipt.destroyed {
                        tracing::debug!(step, %room, "room destroyed, redeploying");
                        room = self.deploy()?;
                        model = RoomModel::funded(self.config.initial_deposit);
                        rooms_deployed += 1;
                    }
                }
                Err(_) => stats.reverted += 1,
            }

            let actual = self.chain.balance_of(&room);
            if actual != model.balance {
                violations.push(format!(
                    "step {step}: room balance {actual}, modelled {}",
                    model.balance
                ));
                model.balance = actual;
            }
            if self.chain.total_supply() != supply {
                violations.push(format!("step {step}: total supply changed"));
            }
        }

        tracing::info!(
            seed = self.config.seed,
            steps = self.config.steps,
            rooms_deployed,
            violations = violations.len(),
            "simulation finished"
        );
        Ok(SimulationReport {
            seed: self.config.seed,
            steps: self.config.steps,
            rooms_deployed,
            calls,
            final_room_balance: self.chain.balance_of(&room),
            violations,
        })
    }

    fn deploy(&mut self) -> Result<Address, SimulationError> {
        self.chain
            .create_room(self.owner, self.config.initial_deposit)
            .map(|receipt| receipt.room)
            .map_err(SimulationError::Deploy)
    }

    fn random_transaction(&mut self, room: Address) -> Transaction {
        // Owner-heavy so that guarded calls mostly get past authorization.
        let from = if self.rng.gen_bool(0.7) {
            self.owner
        } else {
            *self.accounts.choose(&mut self.rng).unwrap_or(&self.owner)
        };
        let amount = self.random_amount();
        let call = match self.rng.gen_range(0..100u32) {
            0..=29 => RoomCall::Deposit,
            30..=59 => RoomCall::SendReward {
                amount,
                recipient: self.random_recipient(),
                reward_id: self.rng.gen_range(0..self.config.reward_id_space.max(1)),
            },
            60..=67 => RoomCall::Pause,
            68..=75 => RoomCall::Unpause,
            76..=81 => RoomCall::Activate,
            82..=87 => RoomCall::Deactivate,
            88..=95 => RoomCall::RefundToOwner,
            96..=97 => RoomCall::Destroy,
            _ => RoomCall::DestroyAndSend {
                recipient: self.random_recipient(),
            },
        };
        let value = match call {
            RoomCall::Deposit => amount,
            // occasionally attach value to a non-payable call
            _ if self.rng.gen_bool(0.05) => 1,
            _ => 0,
        };
        Transaction::new(from, room, call).with_value(value)
    }

    fn random_amount(&mut self) -> Amount {
        if self.rng.gen_bool(0.1) {
            return 0;
        }
        self.rng.gen_range(1..=UNIT / 2)
    }

    fn random_recipient(&mut self) -> Address {
        if self.rng.gen_bool(0.05) {
            return Address::ZERO;
        }
        *self.accounts.choose(&mut self.rng).unwrap_or(&self.owner)
    }
}
