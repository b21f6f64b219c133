//! Realtime item feed.
//!
//! The engine never returns state to other viewers directly; every committed
//! claim reaches them as a new snapshot on their feed.

use futures::StreamExt;

use crate::error::StoreError;
use crate::identity::Viewer;
use crate::item::Item;
use crate::list::List;
use crate::store::{DocumentStore, ItemStream};
use crate::visibility::{project, ItemView};

pub struct ItemFeed {
    list: List,
    stream: ItemStream,
    latest: Option<Vec<Item>>,
}

impl ItemFeed {
    pub async fn open<S>(store: &S, list: List) -> Result<Self, StoreError>
    where
        S: DocumentStore + ?Sized,
    {
        let stream = store.subscribe(list.id).await?;
        Ok(Self {
            list,
            stream,
            latest: None,
        })
    }

    pub fn list(&self) -> &List {
        &self.list
    }

    /// Wait for the next snapshot. `None` once the store stops the feed.
    pub async fn next(&mut self) -> Option<&[Item]> {
        let items = self.stream.next().await?;
        self.latest = Some(items);
        self.latest.as_deref()
    }

    /// Wait until a snapshot satisfies `done`.
    pub async fn wait_until<F>(&mut self, done: F) -> Option<&[Item]>
    where
        F: Fn(&[Item]) -> bool,
    {
        if !self.latest.as_deref().is_some_and(&done) {
            loop {
                let items = self.stream.next().await?;
                let finished = done(&items);
                self.latest = Some(items);
                if finished {
                    break;
                }
            }
        }
        self.latest.as_deref()
    }

    pub fn latest(&self) -> Option<&[Item]> {
        self.latest.as_deref()
    }

    /// The latest snapshot projected for `viewer`.
    pub fn views(&self, viewer: &Viewer) -> Vec<ItemView> {
        self.latest
            .iter()
            .flatten()
            .map(|item| project(item, &self.list, viewer))
            .collect()
    }
}
