//! Scripted scenarios: a JSON list of steps replayed against a fresh chain.
//!
//! Accounts are referenced by genesis label or hex address, rooms by the name
//! given at creation or by hex address. A step may state whether it expects to
//! succeed or revert; the report counts every mismatch.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    address::{serde_amount, Address, Amount, RewardId},
    chain::{Chain, ChainSnapshot, Receipt, Transaction},
    config::{ConfigError, GenesisConfig},
    room::RoomCall,
};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to read script {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse script {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("step {step}: unknown room {name}")]
    UnknownRoom { step: usize, name: String },
    #[error("step {step}: room name {name} is already taken")]
    DuplicateRoomName { step: usize, name: String },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    #[default]
    Any,
    Ok,
    Revert,
}

impl Expectation {
    fn matches(self, succeeded: bool) -> bool {
        match self {
            Expectation::Any => true,
            Expectation::Ok => succeeded,
            Expectation::Revert => !succeeded,
        }
    }
}

/// Room call with account references left unresolved.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptCall {
    Deposit,
    SendReward {
        #[serde(with = "serde_amount")]
        amount: Amount,
        recipient: String,
        reward_id: RewardId,
    },
    Pause,
    Unpause,
    Activate,
    Deactivate,
    RefundToOwner,
    Destroy,
    DestroyAndSend {
        recipient: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    CreateRoom {
        from: String,
        #[serde(with = "serde_amount")]
        value: Amount,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        expect: Expectation,
    },
    Call {
        from: String,
        room: String,
        #[serde(default, with = "serde_amount")]
        value: Amount,
        call: ScriptCall,
        #[serde(default)]
        expect: Expectation,
    },
}

impl Step {
    fn expectation(&self) -> Expectation {
        match self {
            Step::CreateRoom { expect, .. } | Step::Call { expect, .. } => *expect,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Script {
    #[serde(default)]
    pub genesis: Option<GenesisConfig>,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let bytes = fs::read(path).map_err(|source| ScriptError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ScriptError::Json {
            path: path.display().to_string(),
            source,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepReport {
    pub index: usize,
    pub op: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Receipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub expected: Expectation,
    pub matched: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptReport {
    pub steps: Vec<StepReport>,
    pub mismatches: usize,
    pub rooms: BTreeMap<String, Address>,
    pub snapshot: ChainSnapshot,
}

pub struct ScriptRunner {
    genesis: GenesisConfig,
    chain: Chain,
    rooms: BTreeMap<String, Address>,
}

impl ScriptRunner {
    pub fn new(genesis: GenesisConfig) -> Self {
        let chain = Chain::from_genesis(&genesis);
        Self {
            genesis,
            chain,
            rooms: BTreeMap::new(),
        }
    }

    /// Runs every step; reverts are recorded, not propagated.
    pub fn run(mut self, script: &Script) -> Result<ScriptReport, ScriptError> {
        let mut steps = Vec::with_capacity(script.steps.len());
        for (index, step) in script.steps.iter().enumerate() {
            let report = self.run_step(index, step)?;
            if !report.matched {
                tracing::warn!(
                    step = index,
                    op = %report.op,
                    expected = ?report.expected,
                    error = report.error.as_deref().unwrap_or(""),
                    "step did not match expectation"
                );
            }
            steps.push(report);
        }
        let mismatches = steps.iter().filter(|s| !s.matched).count();
        Ok(ScriptReport {
            steps,
            mismatches,
            rooms: self.rooms,
            snapshot: self.chain.snapshot(),
        })
    }

    pub fn run_step(&mut self, index: usize, step: &Step) -> Result<StepReport, ScriptError> {
        let (op, result) = match step {
            Step::CreateRoom {
                from, value, name, ..
            } => {
                let from = self.genesis.resolve(from)?;
                if let Some(name) = name {
                    if self.rooms.contains_key(name) {
                        return Err(ScriptError::DuplicateRoomName {
                            step: index,
                            name: name.clone(),
                        });
                    }
                }
                let result = self.chain.create_room(from, *value);
                if let (Ok(receipt), Some(name)) = (&result, name) {
                    self.rooms.insert(name.clone(), receipt.room);
                }
                ("create_room".to_string(), result)
            }
            Step::Call {
                from,
                room,
                value,
                call,
                ..
            } => {
                let tx = Transaction {
                    from: self.genesis.resolve(from)?,
                    to: self.resolve_room(index, room)?,
                    value: *value,
                    call: self.resolve_call(call)?,
                };
                (tx.call.name().to_string(), self.chain.execute(&tx))
            }
        };
        let expected = step.expectation();
        let ok = result.is_ok();
        let (receipt, error) = match result {
            Ok(receipt) => (Some(receipt), None),
            Err(err) => (None, Some(err.to_string())),
        };
        Ok(StepReport {
            index,
            op,
            ok,
            receipt,
            error,
            expected,
            matched: expected.matches(ok),
        })
    }

    fn resolve_room(&self, step: usize, name: &str) -> Result<Address, ScriptError> {
        if let Some(address) = self.rooms.get(name) {
            return Ok(*address);
        }
        name.parse().map_err(|_| ScriptError::UnknownRoom {
            step,
            name: name.to_string(),
        })
    }

    fn resolve_call(&self, call: &ScriptCall) -> Result<RoomCall, ScriptError> {
        Ok(match call {
            ScriptCall::Deposit => RoomCall::Deposit,
            ScriptCall::SendReward {
                amount,
                recipient,
                reward_id,
            } => RoomCall::SendReward {
                amount: *amount,
                recipient: self.resolve_recipient(recipient)?,
                reward_id: *reward_id,
            },
            ScriptCall::Pause => RoomCall::Pause,
            ScriptCall::Unpause => RoomCall::Unpause,
            ScriptCall::Activate => RoomCall::Activate,
            ScriptCall::Deactivate => RoomCall::Deactivate,
            ScriptCall::RefundToOwner => RoomCall::RefundToOwner,
            ScriptCall::Destroy => RoomCall::Destroy,
            ScriptCall::DestroyAndSend { recipient } => RoomCall::DestroyAndSend {
                recipient: self.resolve_recipient(recipient)?,
            },
        })
    }

    // Recipients may also be rooms created earlier in the script.
    fn resolve_recipient(&self, name: &str) -> Result<Address, ScriptError> {
        if let Some(address) = self.rooms.get(name) {
            return Ok(*address);
        }
        Ok(self.genesis.resolve(name)?)
    }
}
