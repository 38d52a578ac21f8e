use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

use super::job::{CheckJob, JobState};

/// The `id -> CheckJob` map, remembering the order in which ids arrived from
/// the control plane. That order is preserved through the on-disk snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checklist {
    jobs: HashMap<String, CheckJob>,
    order: Vec<String>,
}

impl Checklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_jobs(jobs: impl IntoIterator<Item = CheckJob>) -> Self {
        let mut checklist = Self::new();
        for job in jobs {
            checklist.insert(job);
        }
        checklist
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&CheckJob> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut CheckJob> {
        self.jobs.get_mut(id)
    }

    /// Inserts or replaces by id. A replaced id keeps its original position.
    pub fn insert(&mut self, job: CheckJob) -> Option<CheckJob> {
        let id = job.id.clone();
        let previous = self.jobs.insert(id.clone(), job);
        if previous.is_none() {
            self.order.push(id);
        }
        previous
    }

    pub fn remove(&mut self, id: &str) -> Option<CheckJob> {
        let removed = self.jobs.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    /// Jobs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &CheckJob> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }

    pub fn count_state(&self, state: Option<JobState>) -> usize {
        self.jobs.values().filter(|job| job.state == state).count()
    }

    /// Highest `modified` stamp seen from the control plane, 0 when empty.
    pub fn update_stamp(&self) -> i64 {
        self.jobs.values().map(|job| job.modified).max().unwrap_or(0)
    }
}

impl Serialize for Checklist {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.jobs.len()))?;
        for job in self.iter() {
            map.serialize_entry(&job.id, job)?;
        }
        map.end()
    }
}

struct ChecklistVisitor;

impl<'de> Visitor<'de> for ChecklistVisitor {
    type Value = Checklist;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map of check id to check descriptor")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut checklist = Checklist::new();
        while let Some((key, mut job)) = access.next_entry::<String, CheckJob>()? {
            // The key is authoritative; an edited file with a mismatched id
            // would otherwise produce two entries for one check.
            job.id = key;
            checklist.insert(job);
        }
        Ok(checklist)
    }
}

impl<'de> Deserialize<'de> for Checklist {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(ChecklistVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_arrival_order() {
        let mut checklist = Checklist::from_jobs(vec![
            CheckJob::new("zeta", "http", 1),
            CheckJob::new("alpha", "port", 1),
            CheckJob::new("mid", "ping", 1),
        ]);
        checklist.insert(CheckJob::new("alpha", "http", 5));
        checklist.remove("zeta");

        let ids: Vec<&str> = checklist.iter().map(|job| job.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "mid"]);
        assert_eq!(checklist.get("alpha").map(|job| job.interval), Some(5));
    }

    #[test]
    fn test_order_survives_json() {
        let checklist = Checklist::from_jobs(vec![
            CheckJob::new("b", "http", 1),
            CheckJob::new("a", "http", 1),
            CheckJob::new("c", "http", 1),
        ]);
        let json = serde_json::to_string_pretty(&checklist).unwrap();
        let restored: Checklist = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, checklist);
        let ids: Vec<&str> = restored.iter().map(|job| job.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_update_stamp() {
        let mut first = CheckJob::new("a", "http", 1);
        first.modified = 10;
        let mut second = CheckJob::new("b", "http", 1);
        second.modified = 42;

        assert_eq!(Checklist::new().update_stamp(), 0);
        assert_eq!(Checklist::from_jobs(vec![first, second]).update_stamp(), 42);
    }
}
