//! Registered accounts.

use crate::{Error, Result};
use parking_lot::RwLock;
use scoot_core::User;
use std::collections::HashMap;
use std::path::Path;

#[derive(Default)]
pub struct UserDirectory {
    passwords: RwLock<HashMap<String, String>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an account. `None` if the name is empty or already taken.
    pub fn register(&self, username: &str, password: &str) -> Option<User> {
        if username.is_empty() {
            return None;
        }
        let mut passwords = self.passwords.write();
        if passwords.contains_key(username) {
            return None;
        }
        passwords.insert(username.to_owned(), password.to_owned());
        Some(User::new(username))
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Option<User> {
        let passwords = self.passwords.read();
        match passwords.get(username) {
            Some(stored) if stored == password => Some(User::new(username)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.passwords.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers every `username:password` line of `contents`, skipping blank
    /// lines. Returns how many accounts were added.
    pub fn seed_from_str(&self, contents: &str) -> Result<usize> {
        let mut added = 0;
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (username, password) = line.split_once(':').ok_or_else(|| Error::UsersFile {
                reason: format!("line {} is not `username:password`", number + 1),
            })?;
            if self.register(username, password).is_some() {
                added += 1;
            } else {
                tracing::warn!(line = number + 1, username, "skipping duplicate or empty user");
            }
        }
        Ok(added)
    }

    pub fn seed_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| Error::UsersFile {
            reason: format!("{}: {e}", path.display()),
        })?;
        self.seed_from_str(&contents)
    }
}
