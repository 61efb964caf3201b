use std::collections::HashMap;

use crate::{frame::Role, stream::MuxStream, Error, Result};

/// Live stream bookkeeping of one session, partitioned by role.
///
/// Both peers may pick the same stream id independently; the two never
/// collide because frames carry the originating role and each role has its
/// own map. Entries are removed as soon as a stream reaches its terminal
/// state, so a frame for a removed stream resolves to
/// [`Error::UnknownStream`].
#[derive(Default)]
pub(crate) struct Registry {
    initiator: HashMap<String, MuxStream>,
    recipient: HashMap<String, MuxStream>,
}

impl Registry {
    fn map(&self, role: Role) -> &HashMap<String, MuxStream> {
        match role {
            Role::Initiator => &self.initiator,
            Role::Recipient => &self.recipient,
        }
    }

    fn map_mut(&mut self, role: Role) -> &mut HashMap<String, MuxStream> {
        match role {
            Role::Initiator => &mut self.initiator,
            Role::Recipient => &mut self.recipient,
        }
    }

    /// Registers a new stream under (role, id).
    pub(crate) fn try_insert(&mut self, role: Role, stream: MuxStream) -> Result<()> {
        let id = stream.id().to_string();

        if self.map(role).contains_key(&id) {
            return Err(Error::DuplicateStream(id));
        }

        self.map_mut(role).insert(id, stream);

        Ok(())
    }

    /// Looks up the live stream registered under (role, id).
    pub(crate) fn get(&self, role: Role, id: &str) -> Option<MuxStream> {
        self.map(role).get(id).cloned()
    }

    pub(crate) fn remove(&mut self, role: Role, id: &str) -> Option<MuxStream> {
        self.map_mut(role).remove(id)
    }

    /// All live streams, both roles.
    pub(crate) fn snapshot(&self) -> Vec<MuxStream> {
        self.initiator
            .values()
            .chain(self.recipient.values())
            .cloned()
            .collect()
    }
}
