//! Participant-list bookkeeping shared by threads and events.

use convo_shared::Key;
use serde::{Deserialize, Serialize};

use super::{MembershipError, User};

/// Denormalized copy of a participant's public profile, kept beside the key
/// list so mail can be rendered without loading every user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPartial {
    pub id: Key,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar_url: String,
}

impl UserPartial {
    pub fn of(user: &User) -> Result<Self, MembershipError> {
        let id = user
            .key
            .ok_or_else(|| MembershipError::Invalid("user has not been saved".into()))?;
        Ok(Self {
            id,
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            full_name: user.full_name.clone(),
            email: user.email.clone(),
            avatar_url: user.avatar_url.clone(),
        })
    }
}

pub(super) fn add(
    users: &mut Vec<Key>,
    partials: &mut Vec<UserPartial>,
    owner: Key,
    user: &User,
    limit: usize,
) -> Result<Key, MembershipError> {
    let partial = UserPartial::of(user)?;
    let key = partial.id;
    if key == owner {
        return Err(MembershipError::Conflict("the owner is already a participant".into()));
    }
    if users.contains(&key) {
        return Err(MembershipError::Conflict("already a participant".into()));
    }
    if users.len() >= limit {
        return Err(MembershipError::Limit(limit));
    }
    users.push(key);
    partials.push(partial);
    Ok(key)
}

pub(super) fn remove(
    users: &mut Vec<Key>,
    partials: &mut Vec<UserPartial>,
    owner: Key,
    key: Key,
) -> Result<(), MembershipError> {
    if !users.contains(&key) {
        return Err(MembershipError::NotFound(key));
    }
    if key == owner {
        return Err(MembershipError::Forbidden("the owner cannot be removed".into()));
    }
    users.retain(|k| *k != key);
    partials.retain(|p| p.id != key);
    Ok(())
}

/// Rewrite `from` to `to` in a key list, keeping first-occurrence order and
/// dropping the duplicate this may create.
pub(crate) fn replace_key(keys: &mut Vec<Key>, from: Key, to: Key) {
    if !keys.contains(&from) {
        return;
    }
    let mut seen = Vec::with_capacity(keys.len());
    for key in keys.drain(..) {
        let key = if key == from { to } else { key };
        if !seen.contains(&key) {
            seen.push(key);
        }
    }
    *keys = seen;
}

pub(super) fn replace_partial(partials: &mut Vec<UserPartial>, from: Key, to: &UserPartial) {
    if !partials.iter().any(|p| p.id == from) {
        return;
    }
    let had_to = partials.iter().any(|p| p.id == to.id);
    if had_to {
        partials.retain(|p| p.id != from);
    } else if let Some(p) = partials.iter_mut().find(|p| p.id == from) {
        *p = to.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_shared::Kind;

    #[test]
    fn test_replace_key_dedupes() {
        let a = Key::new(Kind::User, 1);
        let b = Key::new(Kind::User, 2);
        let c = Key::new(Kind::User, 3);
        let mut keys = vec![a, b, c];
        replace_key(&mut keys, b, a);
        assert_eq!(keys, vec![a, c]);

        let mut keys = vec![b, c];
        replace_key(&mut keys, b, a);
        assert_eq!(keys, vec![a, c]);
    }
}
