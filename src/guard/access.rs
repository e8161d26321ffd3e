//! Static address allow/deny lists.

use std::collections::HashSet;

use parking_lot::RwLock;
use tracing::info;

#[derive(Debug, Default)]
struct Lists {
    whitelist: HashSet<String>,
    blacklist: HashSet<String>,
}

/// Whitelist and blacklist of client addresses.
///
/// Both sets sit behind one lock so an address moved from one list to the
/// other is never observed in both.
#[derive(Debug, Default)]
pub struct IpAccessList {
    lists: RwLock<Lists>,
}

impl IpAccessList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the lists. An address present in both ends up blacklisted.
    pub fn from_lists<W, B>(whitelist: W, blacklist: B) -> Self
    where
        W: IntoIterator,
        W::Item: AsRef<str>,
        B: IntoIterator,
        B::Item: AsRef<str>,
    {
        let access = Self::new();
        for address in whitelist {
            access.add_to_whitelist(address.as_ref());
        }
        for address in blacklist {
            access.add_to_blacklist(address.as_ref());
        }

        let lists = access.lists.read();
        info!(
            whitelisted = lists.whitelist.len(),
            blacklisted = lists.blacklist.len(),
            "Initialized IP access lists"
        );
        drop(lists);
        access
    }

    pub fn is_whitelisted(&self, address: &str) -> bool {
        self.lists.read().whitelist.contains(address)
    }

    pub fn is_blacklisted(&self, address: &str) -> bool {
        self.lists.read().blacklist.contains(address)
    }

    /// Whitelist `address`, removing it from the blacklist. Returns whether it
    /// was newly whitelisted.
    pub fn add_to_whitelist(&self, address: &str) -> bool {
        let mut lists = self.lists.write();
        lists.blacklist.remove(address);
        let added = lists.whitelist.insert(address.to_string());
        if added {
            info!(address = %address, "Added address to whitelist");
        }
        added
    }

    pub fn remove_from_whitelist(&self, address: &str) -> bool {
        let removed = self.lists.write().whitelist.remove(address);
        if removed {
            info!(address = %address, "Removed address from whitelist");
        }
        removed
    }

    /// Blacklist `address`, removing it from the whitelist. Returns whether it
    /// was newly blacklisted.
    pub fn add_to_blacklist(&self, address: &str) -> bool {
        let mut lists = self.lists.write();
        lists.whitelist.remove(address);
        let added = lists.blacklist.insert(address.to_string());
        if added {
            info!(address = %address, "Added address to blacklist");
        }
        added
    }

    pub fn remove_from_blacklist(&self, address: &str) -> bool {
        let removed = self.lists.write().blacklist.remove(address);
        if removed {
            info!(address = %address, "Removed address from blacklist");
        }
        removed
    }

    /// Snapshot of the whitelist.
    pub fn whitelisted(&self) -> HashSet<String> {
        self.lists.read().whitelist.clone()
    }

    /// Snapshot of the blacklist.
    pub fn blacklisted(&self) -> HashSet<String> {
        self.lists.read().blacklist.clone()
    }
}
