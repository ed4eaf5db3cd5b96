use sha2::{Digest, Sha256};

use crate::{
    address::Address,
    room::{CallContext, RoomError, RoomEvent, RoomLedger},
};

/// Deploys rooms at deterministic addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomFactory {
    address: Address,
    nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    pub address: Address,
    pub room: RoomLedger,
    pub event: RoomEvent,
}

impl RoomFactory {
    pub fn new(address: Address) -> Self {
        Self { address, nonce: 0 }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Address the next deployment will receive.
    pub fn next_address(&self) -> Address {
        room_address(&self.address, self.nonce)
    }

    /// Creates a room owned by the caller and funded with the attached value.
    pub fn create_room(&mut self, ctx: &CallContext) -> Result<Deployment, RoomError> {
        if ctx.value == 0 {
            return Err(RoomError::ZeroValue);
        }
        let address = self.next_address();
        self.nonce += 1;
        Ok(Deployment {
            address,
            room: RoomLedger::new(ctx.caller, ctx.value),
            event: RoomEvent::RoomCreated {
                room: address,
                owner: ctx.caller,
            },
        })
    }
}

fn room_address(factory: &Address, nonce: u64) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(factory.as_bytes());
    hasher.update(nonce.to_be_bytes());
    Address::from_digest(hasher.finalize().into())
}
