use std::sync::Arc;

use pairchat_storage::{
    ContactRecord, ContactStore, Storage, Subscription, UserDirectory, UserId, UserRecord,
    normalize_email, subscribe_contacts,
};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, info};

use crate::error::{
    BlankEmailSnafu, ChatResult, SelfContactSnafu, StorageSnafu, UserNotFoundSnafu,
};

/// Resolves emails to users and maintains each user's contact list.
#[derive(Clone)]
pub struct ContactDirectory {
    storage: Arc<dyn Storage>,
}

impl ContactDirectory {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Records the identity issued at sign-in together with its email.
    pub async fn register_user(&self, user_id: &UserId, email: &str) -> ChatResult<UserRecord> {
        ensure!(
            !normalize_email(email).is_empty(),
            BlankEmailSnafu {
                stage: "register-user-validate",
            }
        );

        let record = self
            .storage
            .register_user(user_id, email)
            .await
            .context(StorageSnafu {
                stage: "register-user-write",
            })?;
        info!(user_id = %record.id, email = %record.email, "registered user");
        Ok(record)
    }

    /// Earliest registered user with this email, if any. A blank email matches nobody.
    pub async fn lookup_user_by_email(&self, email: &str) -> ChatResult<Option<UserRecord>> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Ok(None);
        }

        let matches = self
            .storage
            .find_users_by_email(&email)
            .await
            .context(StorageSnafu {
                stage: "lookup-user-query",
            })?;
        if matches.len() > 1 {
            debug!(%email, count = matches.len(), "email is shared by several users, using the earliest");
        }

        Ok(matches.into_iter().next())
    }

    pub async fn user_by_id(&self, user_id: &UserId) -> ChatResult<Option<UserRecord>> {
        self.storage.get_user(user_id).await.context(StorageSnafu {
            stage: "user-by-id-query",
        })
    }

    /// Adds the user registered under `email` to the owner's contacts. Idempotent.
    pub async fn add_contact(&self, owner_id: &UserId, email: &str) -> ChatResult<ContactRecord> {
        ensure!(
            !normalize_email(email).is_empty(),
            BlankEmailSnafu {
                stage: "add-contact-validate",
            }
        );

        let contact = self
            .lookup_user_by_email(email)
            .await?
            .context(UserNotFoundSnafu {
                stage: "add-contact-lookup",
                email: normalize_email(email),
            })?;
        ensure!(
            contact.id != *owner_id,
            SelfContactSnafu {
                stage: "add-contact-self",
                user_id: owner_id.to_string(),
            }
        );

        let record = self
            .storage
            .upsert_contact(owner_id, &contact)
            .await
            .context(StorageSnafu {
                stage: "add-contact-write",
            })?;
        info!(owner_id = %owner_id, contact_user_id = %record.contact_user_id, "added contact");
        Ok(record)
    }

    /// Live contact list, ordered by email.
    pub fn list_contacts(&self, owner_id: &UserId) -> Subscription<Vec<ContactRecord>> {
        subscribe_contacts(self.storage.clone(), owner_id.clone())
    }

    pub async fn contacts(&self, owner_id: &UserId) -> ChatResult<Vec<ContactRecord>> {
        self.storage
            .list_contacts(owner_id)
            .await
            .context(StorageSnafu {
                stage: "contacts-query",
            })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pairchat_storage::{SqliteStorage, StorageErrorKind};

    use super::*;

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    async fn directory() -> ContactDirectory {
        let storage = SqliteStorage::open(":memory:").await.unwrap();
        let directory = ContactDirectory::new(Arc::new(storage));
        directory.register_user(&user("u1"), "a@x.com").await.unwrap();
        directory.register_user(&user("u2"), "B@X.com").await.unwrap();
        directory
    }

    #[tokio::test]
    async fn lookup_matches_case_insensitively() {
        let directory = directory().await;

        let found = directory.lookup_user_by_email(" b@x.COM ").await.unwrap();
        assert_eq!(found.map(|record| record.id), Some(user("u2")));
        assert!(directory.lookup_user_by_email("c@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blank_lookup_finds_nobody() {
        let directory = directory().await;

        assert_eq!(directory.lookup_user_by_email("").await.unwrap(), None);
        assert_eq!(directory.lookup_user_by_email(" \t ").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lookup_prefers_earliest_registration() {
        let directory = directory().await;
        // u0 sorts before u1 but registers later.
        tokio::time::sleep(Duration::from_millis(5)).await;
        directory.register_user(&user("u0"), "a@x.com").await.unwrap();

        let found = directory.lookup_user_by_email("a@x.com").await.unwrap();
        assert_eq!(found.map(|record| record.id), Some(user("u1")));
    }

    #[tokio::test]
    async fn add_contact_is_idempotent_and_directional() {
        let directory = directory().await;

        let first = directory.add_contact(&user("u1"), "b@x.com").await.unwrap();
        let second = directory.add_contact(&user("u1"), "B@x.com").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.email, "b@x.com");

        assert_eq!(directory.contacts(&user("u1")).await.unwrap(), vec![first]);
        assert!(directory.contacts(&user("u2")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_contact_rejects_bad_targets() {
        let directory = directory().await;

        let cases = [
            ("a@x.com", StorageErrorKind::SelfReference),
            ("nobody@x.com", StorageErrorKind::NotFound),
            ("   ", StorageErrorKind::Validation),
        ];
        for (email, expected) in cases {
            let error = directory.add_contact(&user("u1"), email).await.unwrap_err();
            assert_eq!(error.kind(), expected, "{email:?}");
        }
        assert!(directory.contacts(&user("u1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn contact_list_updates_live() {
        let directory = directory().await;
        let mut contacts = directory.list_contacts(&user("u1"));

        let initial = tokio::time::timeout(Duration::from_secs(5), contacts.next_snapshot())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(initial.is_empty());

        directory.add_contact(&user("u1"), "b@x.com").await.unwrap();
        let updated = tokio::time::timeout(Duration::from_secs(5), contacts.next_snapshot())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].contact_user_id, user("u2"));
    }
}
