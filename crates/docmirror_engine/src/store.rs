//! The indexed document collection.

use docmirror_protocol::Document;
use std::collections::HashMap;

/// A document collection indexed by identifier.
///
/// Two views of one set, kept in lockstep: an ordered sequence (stable
/// presentation order, inserts append) and an identifier → position
/// index. Every mutation maintains both.
#[derive(Debug, Default)]
pub struct IndexedCollection {
    documents: Vec<Document>,
    positions: HashMap<String, usize>,
}

impl IndexedCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a collection from a snapshot, preserving its order.
    ///
    /// Duplicate identifiers keep their first position, last value wins.
    pub fn from_documents(documents: Vec<Document>) -> Self {
        let mut collection = Self::new();
        for doc in documents {
            let id = doc.id.clone();
            collection.commit(&id, Some(doc));
        }
        collection
    }

    /// The ordered document sequence.
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Looks up a document by identifier.
    pub fn get(&self, id: &str) -> Option<&Document> {
        self.positions.get(id).map(|&pos| &self.documents[pos])
    }

    /// Number of documents in the collection.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if the collection holds no documents.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Commits the outcome of a mutation for `id`.
    ///
    /// - absent → present: insert, appended to the sequence
    /// - present → present: replace in place
    /// - present → absent: delete, positions after it shift down
    /// - absent → absent: no-op
    ///
    /// Returns true if the collection changed.
    pub fn commit(&mut self, id: &str, next: Option<Document>) -> bool {
        match (self.positions.get(id).copied(), next) {
            (None, Some(doc)) => {
                self.positions.insert(id.to_string(), self.documents.len());
                self.documents.push(doc);
                true
            }
            (Some(pos), Some(doc)) => {
                self.documents[pos] = doc;
                true
            }
            (Some(pos), None) => {
                self.documents.remove(pos);
                self.positions.remove(id);
                for position in self.positions.values_mut() {
                    if *position > pos {
                        *position -= 1;
                    }
                }
                true
            }
            (None, None) => false,
        }
    }
}
