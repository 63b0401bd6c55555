//! Registered mirror queries and their publish state.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::core::{DatabaseVersion, Query, QueryId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown query id [{0}]")]
    UnknownQuery(QueryId),
    #[error("no more space for additional queries to be registered")]
    Exhausted,
}

#[derive(Clone, Debug)]
pub struct QueryRecord {
    pub query: Query,
    /// Database version most recently published on this query's topic.
    pub last_sent_version: Option<DatabaseVersion>,
    /// Pending catch-up requests; `None` asks for a full snapshot.
    pub remediation: BTreeSet<Option<DatabaseVersion>>,
    pub last_subscriber_seen: Instant,
}

impl QueryRecord {
    fn new(query: Query, now: Instant) -> Self {
        Self {
            query,
            last_sent_version: None,
            remediation: BTreeSet::new(),
            last_subscriber_seen: now,
        }
    }
}

#[derive(Debug, Default)]
pub struct QueryRegistry {
    queries: BTreeMap<QueryId, QueryRecord>,
    last_query_id: QueryId,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query, deduplicating on equality. An existing identical
    /// query has its registration time refreshed and keeps its id; a new
    /// query gets the next free id by linear probing.
    pub fn register(&mut self, query: Query, now: Instant) -> Result<QueryId, RegistryError> {
        for (&id, record) in &mut self.queries {
            if record.query == query {
                record.last_subscriber_seen = now;
                return Ok(id);
            }
        }

        let mut candidate = self.last_query_id;
        let mut attempts: u64 = 0;
        loop {
            candidate = candidate.next();
            attempts += 1;
            if attempts == u64::MAX {
                return Err(RegistryError::Exhausted);
            }
            if !self.queries.contains_key(&candidate) {
                break;
            }
        }

        self.queries.insert(candidate, QueryRecord::new(query, now));
        self.last_query_id = candidate;
        Ok(candidate)
    }

    /// Queue a catch-up request for the next update tick. Remedial patches
    /// are only scheduled for versions behind what was already sent.
    pub fn request_changes(
        &mut self,
        id: QueryId,
        version: DatabaseVersion,
        full_update: bool,
    ) -> Result<(), RegistryError> {
        let record = self
            .queries
            .get_mut(&id)
            .ok_or(RegistryError::UnknownQuery(id))?;
        if full_update {
            record.remediation.insert(None);
        } else if let Some(last_sent) = record.last_sent_version
            && version.precedes(last_sent)
        {
            record.remediation.insert(Some(version));
        }
        Ok(())
    }

    /// Drop queries that have had no subscribers for longer than the grace
    /// period. Returns the removed ids.
    pub fn cleanup(
        &mut self,
        now: Instant,
        grace_period: Duration,
        subscriber_count: impl Fn(QueryId) -> usize,
    ) -> Vec<QueryId> {
        let doomed: Vec<QueryId> = self
            .queries
            .iter()
            .filter(|&(&id, record)| {
                subscriber_count(id) == 0
                    && now.saturating_duration_since(record.last_subscriber_seen) > grace_period
            })
            .map(|(&id, _)| id)
            .collect();
        for id in &doomed {
            self.queries.remove(id);
        }
        doomed
    }

    pub fn get(&self, id: QueryId) -> Option<&QueryRecord> {
        self.queries.get(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (QueryId, &mut QueryRecord)> {
        self.queries.iter_mut().map(|(&id, record)| (id, record))
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Parallel id and query lists for the queries-info broadcast.
    pub fn announce(&self) -> (Vec<QueryId>, Vec<Query>) {
        let ids = self.queries.keys().copied().collect();
        let queries = self.queries.values().map(|r| r.query.clone()).collect();
        (ids, queries)
    }
}
