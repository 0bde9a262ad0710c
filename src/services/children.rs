//! Lazy child enumeration.
//!
//! A [`ChildCursor`] pulls one listing page at a time, merging each page
//! into the bucket index before handing its entries out, so large folders
//! never sit in memory whole.

use crate::{
    errors::NavResult,
    models::{BucketMetadata, ChildItem, Item, ObjectMetadata, ObjectPath},
    services::{
        lister::ObjectLister,
        object_index::{BucketObjectIndex, ListingDepth, ScanTicket},
    },
    store::ObjectPage,
    telemetry::OnceReporter,
};
use futures::{Stream, stream};
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

struct Listing {
    lister: ObjectLister,
    index: Arc<BucketObjectIndex>,
    depth: ListingDepth,
    /// Taken before the first page is requested.
    ticket: Option<ScanTicket>,
    seen_names: HashSet<String>,
    seen_prefixes: HashSet<String>,
}

/// Pull-based sequence of the children of one path.
///
/// Restarting means asking the engine for a new cursor; nothing is resumed.
pub struct ChildCursor {
    parent: ObjectPath,
    listing: Option<Listing>,
    ready: VecDeque<ChildItem>,
    reporter: OnceReporter,
}

impl ChildCursor {
    pub(crate) fn buckets(buckets: Vec<BucketMetadata>, reporter: OnceReporter) -> Self {
        let ready = buckets
            .into_iter()
            .map(|bucket| ChildItem {
                name: bucket.name.clone(),
                path: ObjectPath::bucket(bucket.name.clone()),
                item: Item::Bucket(bucket),
            })
            .collect();
        Self {
            parent: ObjectPath::drive(),
            listing: None,
            ready,
            reporter,
        }
    }

    /// A plain object has no children; enumerating it yields the object itself.
    pub(crate) fn single(object: ObjectMetadata, reporter: OnceReporter) -> Self {
        let path = object.path();
        let child = ChildItem {
            name: path.leaf().to_string(),
            path: path.clone(),
            item: Item::Object(object),
        };
        Self {
            parent: path,
            listing: None,
            ready: VecDeque::from([child]),
            reporter,
        }
    }

    pub(crate) fn listing(
        parent: ObjectPath,
        lister: ObjectLister,
        index: Arc<BucketObjectIndex>,
        recursive: bool,
        reporter: OnceReporter,
    ) -> Self {
        Self {
            parent,
            listing: Some(Listing {
                lister,
                index,
                depth: if recursive {
                    ListingDepth::Recursive
                } else {
                    ListingDepth::Shallow
                },
                ticket: None,
                seen_names: HashSet::new(),
                seen_prefixes: HashSet::new(),
            }),
            ready: VecDeque::new(),
            reporter,
        }
    }

    pub fn parent(&self) -> &ObjectPath {
        &self.parent
    }

    /// Next child, fetching another page when the current one is used up.
    pub async fn next(&mut self) -> NavResult<Option<ChildItem>> {
        loop {
            if let Some(child) = self.ready.pop_front() {
                return Ok(Some(child));
            }
            let Some(listing) = self.listing.as_mut() else {
                self.reporter.success();
                return Ok(None);
            };

            let ticket = match listing.ticket {
                Some(ticket) => ticket,
                None => *listing.ticket.insert(listing.index.begin_scan().await),
            };
            match listing.lister.next_page().await {
                Ok(Some(page)) => {
                    listing.index.merge_page(&page, ticket).await;
                    if let Err(err) = self.accept(page) {
                        self.listing = None;
                        self.reporter.failure(&err);
                        return Err(err);
                    }
                }
                Ok(None) => {
                    let prefix = listing.lister.prefix().to_string();
                    listing
                        .index
                        .complete_scan(
                            &prefix,
                            listing.depth,
                            &listing.seen_names,
                            &listing.seen_prefixes,
                            ticket,
                        )
                        .await;
                    self.listing = None;
                }
                Err(err) => {
                    listing.index.note_failure(&err);
                    self.listing = None;
                    self.reporter.failure(&err);
                    return Err(err);
                }
            }
        }
    }

    /// Turn one page into children, skipping the folder's own marker and
    /// prefixes already reported by an earlier page.
    fn accept(&mut self, page: ObjectPage) -> NavResult<()> {
        let Some(listing) = self.listing.as_mut() else {
            return Ok(());
        };
        let Some(bucket) = self.parent.bucket_name() else {
            return Ok(());
        };
        let own_marker = listing.lister.prefix().to_string();

        for object in page.items {
            listing.seen_names.insert(object.name.clone());
            if object.name == own_marker {
                continue;
            }
            let name = self.parent.relative_child_path(&object.name)?.to_string();
            let path = ObjectPath::object(bucket, &object.name);
            let item = if object.is_marker() {
                Item::Folder {
                    path: object.name.clone(),
                    marker: Some(object),
                }
            } else {
                Item::Object(object)
            };
            self.ready.push_back(ChildItem { name, path, item });
        }

        for prefix in page.prefixes {
            listing.seen_names.insert(prefix.clone());
            if !listing.seen_prefixes.insert(prefix.clone()) {
                continue;
            }
            let name = self.parent.relative_child_path(&prefix)?.to_string();
            self.ready.push_back(ChildItem {
                name,
                path: ObjectPath::object(bucket, &prefix),
                item: Item::Folder {
                    path: prefix,
                    marker: None,
                },
            });
        }
        Ok(())
    }

    /// Drain the cursor.
    pub async fn collect(mut self) -> NavResult<Vec<ChildItem>> {
        let mut children = Vec::new();
        while let Some(child) = self.next().await? {
            children.push(child);
        }
        Ok(children)
    }

    pub fn into_stream(self) -> impl Stream<Item = NavResult<ChildItem>> {
        stream::try_unfold(self, |mut cursor| async move {
            Ok(cursor.next().await?.map(|child| (child, cursor)))
        })
    }
}
