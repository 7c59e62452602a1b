//! Property-based test generators using proptest.
//!
//! Edits are generated over a small key space so that replicas collide on
//! the same rows often.

use crate::fixtures::customer;
use rowsync_codec::Value;
use rowsync_core::{CoreResult, MemoryProvider};
use proptest::prelude::*;

/// Largest customer id generated.
pub const MAX_CUSTOMER_ID: i64 = 8;

/// One application write on the `Customer` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerEdit {
    /// Insert, or rename when the row exists.
    Upsert {
        /// Customer id.
        id: i64,
        /// New name.
        name: String,
    },
    /// Delete, ignored when the row does not exist.
    Delete {
        /// Customer id.
        id: i64,
    },
}

/// Strategy for generating customer names.
pub fn customer_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{0,7}").expect("Invalid regex")
}

/// Strategy for generating customer ids within the shared key space.
pub fn customer_id_strategy() -> impl Strategy<Value = i64> {
    1..=MAX_CUSTOMER_ID
}

/// Strategy for generating one edit, upserts being three times as likely as
/// deletes.
pub fn customer_edit_strategy() -> impl Strategy<Value = CustomerEdit> {
    prop_oneof![
        3 => (customer_id_strategy(), customer_name_strategy())
            .prop_map(|(id, name)| CustomerEdit::Upsert { id, name }),
        1 => customer_id_strategy().prop_map(|id| CustomerEdit::Delete { id }),
    ]
}

/// Strategy for generating a sequence of edits.
pub fn customer_edits_strategy(max_len: usize) -> impl Strategy<Value = Vec<CustomerEdit>> {
    prop::collection::vec(customer_edit_strategy(), 0..=max_len)
}

/// Applies edits through the application write path, firing triggers.
pub async fn apply_edits(db: &MemoryProvider, edits: &[CustomerEdit]) -> CoreResult<()> {
    for edit in edits {
        match edit {
            CustomerEdit::Upsert { id, name } => {
                let key = [Value::from(*id)];
                if db.row("Customer", &key).await?.is_some() {
                    db.update_row("Customer", &key, &[("name", name.as_str().into())])
                        .await?;
                } else {
                    db.insert_row("Customer", customer(*id, name)).await?;
                }
            }
            CustomerEdit::Delete { id } => {
                let key = [Value::from(*id)];
                if db.row("Customer", &key).await?.is_some() {
                    db.delete_row("Customer", &key).await?;
                }
            }
        }
    }
    Ok(())
}
