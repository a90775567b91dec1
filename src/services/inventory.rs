//! Inventory Service
//!
//! Non-fungible items won from draws or bought on the market.
//! `available` items can be used, transferred or listed; `listed` items are
//! owned by the market until the listing is sold or withdrawn; `used` is final.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::db::{InventoryItem, ItemStatus, SettlementStore, UnitOfWork};
use crate::error::{Result, SettlementError};
use crate::types::UserId;

/// Inserts a freshly granted item inside the caller's unit.
pub async fn grant_item(
    uow: &mut dyn UnitOfWork,
    owner_id: UserId,
    item_code: &str,
    source: &str,
) -> Result<InventoryItem> {
    let now = Utc::now();
    let item = InventoryItem {
        id: Uuid::new_v4(),
        owner_id,
        item_code: item_code.to_string(),
        status: ItemStatus::Available,
        source: source.to_string(),
        acquired_at: now,
        updated_at: now,
    };
    uow.insert_item(&item).await?;
    Ok(item)
}

/// Locks an item and checks that `owner_id` holds it in `available` state.
pub async fn lock_owned_item(uow: &mut dyn UnitOfWork, owner_id: UserId, item_id: Uuid) -> Result<InventoryItem> {
    let item = uow
        .lock_item(item_id)
        .await?
        .filter(|item| item.owner_id == owner_id)
        .ok_or_else(|| SettlementError::NotFound(format!("item {item_id}")))?;
    if item.status != ItemStatus::Available {
        return Err(SettlementError::Validation(format!("item {item_id} is {}", item.status)));
    }
    Ok(item)
}

#[derive(Clone)]
pub struct InventoryService {
    store: Arc<dyn SettlementStore>,
}

impl InventoryService {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    /// Newest first.
    pub async fn list_items(&self, owner_id: UserId) -> Result<Vec<InventoryItem>> {
        self.store.list_items(owner_id).await
    }

    /// Consumes an item; a second call fails.
    pub async fn use_item(&self, owner_id: UserId, item_id: Uuid) -> Result<InventoryItem> {
        let mut uow = self.store.begin().await?;
        let mut item = lock_owned_item(uow.as_mut(), owner_id, item_id).await?;
        item.status = ItemStatus::Used;
        item.updated_at = Utc::now();
        uow.save_item(&item).await?;
        uow.commit().await?;

        tracing::info!(owner_id, %item_id, item_code = %item.item_code, "Item used");
        Ok(item)
    }

    pub async fn transfer_item(&self, from: UserId, to: UserId, item_id: Uuid) -> Result<InventoryItem> {
        if from == to {
            return Err(SettlementError::Validation("cannot transfer an item to its owner".to_string()));
        }

        let mut uow = self.store.begin().await?;
        let mut item = lock_owned_item(uow.as_mut(), from, item_id).await?;
        let now = Utc::now();
        item.owner_id = to;
        item.source = "transfer".to_string();
        item.acquired_at = now;
        item.updated_at = now;
        uow.save_item(&item).await?;
        uow.commit().await?;

        tracing::info!(from, to, %item_id, "Item transferred");
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    async fn seeded() -> (InventoryService, Uuid) {
        let store: Arc<dyn SettlementStore> = Arc::new(MemoryStore::new());
        let mut uow = store.begin().await.unwrap();
        let item = grant_item(uow.as_mut(), 1, "DRAGON_SKIN", "draw").await.unwrap();
        uow.commit().await.unwrap();
        (InventoryService::new(store), item.id)
    }

    #[tokio::test]
    async fn test_use_item_exactly_once() {
        let (inventory, item_id) = seeded().await;

        let used = inventory.use_item(1, item_id).await.unwrap();
        assert_eq!(used.status, ItemStatus::Used);

        let err = inventory.use_item(1, item_id).await.unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
    }

    #[tokio::test]
    async fn test_transfer_moves_ownership() {
        let (inventory, item_id) = seeded().await;

        inventory.transfer_item(1, 2, item_id).await.unwrap();
        assert!(inventory.list_items(1).await.unwrap().is_empty());

        let items = inventory.list_items(2).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source, "transfer");

        // the previous owner no longer sees it
        let err = inventory.use_item(1, item_id).await.unwrap_err();
        assert!(matches!(err, SettlementError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transfer_to_self_rejected() {
        let (inventory, item_id) = seeded().await;
        assert!(inventory.transfer_item(1, 1, item_id).await.is_err());
    }
}
