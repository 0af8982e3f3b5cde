use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::outbox::Outbox;
use crate::error::Result;
use crate::protocol::Response;
use crate::storage::ClientId;
use crate::Error;

/// Maps live clients to their outboxes, for responses that are not replies
/// to the client's own request.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, Arc<Outbox>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client: ClientId, outbox: Arc<Outbox>) {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client, outbox);
    }

    pub fn unregister(&self, client: ClientId) -> bool {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client)
            .is_some()
    }

    pub fn get(&self, client: ClientId) -> Option<Arc<Outbox>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues an unsolicited response for `client`. Never touches the socket.
    pub fn send(&self, client: ClientId, response: Response) -> Result<()> {
        let outbox = self.get(client).ok_or(Error::NotConnected)?;
        outbox.send(response)
    }
}
