//! Local account lookup
//!
//! The session only needs two answers about a local user: does the account
//! exist, and may it receive mail. Real deployments plug their user store in
//! behind [`AccountDirectory`]; [`StaticDirectory`] serves the `[[accounts]]`
//! table from the config file.

use crate::config::AccountConfig;
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub username: String,
    pub can_receive: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Case-insensitive lookup by local part
    async fn lookup(&self, username: &str) -> Option<Account>;
}

#[derive(Debug, Default)]
pub struct StaticDirectory {
    accounts: HashMap<String, Account>,
}

impl StaticDirectory {
    pub fn new(accounts: &[AccountConfig]) -> Self {
        Self {
            accounts: accounts
                .iter()
                .map(|a| {
                    let username = a.username.trim().to_lowercase();
                    (
                        username.clone(),
                        Account {
                            username,
                            can_receive: a.can_receive,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[async_trait]
impl AccountDirectory for StaticDirectory {
    async fn lookup(&self, username: &str) -> Option<Account> {
        self.accounts.get(&username.trim().to_lowercase()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_lookup() {
        let directory = StaticDirectory::new(&[
            AccountConfig {
                username: "Bob".to_string(),
                can_receive: true,
            },
            AccountConfig {
                username: "frozen".to_string(),
                can_receive: false,
            },
        ]);

        assert_eq!(directory.len(), 2);
        let bob = directory.lookup("BOB").await.unwrap();
        assert_eq!(bob.username, "bob");
        assert!(bob.can_receive);
        assert!(!directory.lookup("frozen").await.unwrap().can_receive);
        assert!(directory.lookup("nobody").await.is_none());
    }
}
