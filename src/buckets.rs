use smallvec::SmallVec;

use crate::definitions::N_ENTITIES_ON_STACK;
use crate::entity::Entity;

/// An entity list with a checkpoint. Entities pushed since the last
/// [`commit`](ScanList::commit) are uncommitted and can be dropped wholesale
/// with [`rollback`](ScanList::rollback). The scanner uses this to discard a
/// partially consumed function name once the opening parenthesis proves the
/// match.
#[derive(Debug, Default)]
pub struct ScanList {
    items: SmallVec<[Entity; N_ENTITIES_ON_STACK]>,
    uncommitted: usize,
}

impl ScanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entity: Entity) {
        self.items.push(entity);
        self.uncommitted += 1;
    }

    /// Re-inserts an entity that was pulled out while committed, keeping it
    /// committed. Only sound while the list holds nothing uncommitted.
    pub fn push_committed(&mut self, entity: Entity) {
        debug_assert_eq!(self.uncommitted, 0);
        self.items.push(entity);
    }

    /// Makes every currently held entity permanent.
    pub fn commit(&mut self) {
        self.uncommitted = 0;
    }

    /// Drops everything pushed since the last commit.
    pub fn rollback(&mut self) {
        let keep = self.items.len() - self.uncommitted;
        self.items.truncate(keep);
        self.uncommitted = 0;
    }

    pub fn pop_last(&mut self) -> Option<Entity> {
        let popped = self.items.pop();
        if popped.is_some() && self.uncommitted > 0 {
            self.uncommitted -= 1;
        }
        popped
    }

    pub fn first_mut(&mut self) -> Option<&mut Entity> {
        self.items.first_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_uncommitted(&self) -> bool {
        self.uncommitted > 0
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.uncommitted = 0;
    }

    /// Hands the held entities over, leaving the list empty and committed.
    pub fn take_items(&mut self) -> Vec<Entity> {
        self.uncommitted = 0;
        self.items.drain(..).collect()
    }
}

/// Entity lists keyed by priority rank, rank 0 being the highest priority in
/// use. Checkpoints work per slot; `commit_all`/`rollback_all` only visit
/// slots touched since the previous sweep.
#[derive(Debug)]
pub struct RankBuckets {
    slots: Vec<Option<ScanList>>,
    touched: SmallVec<[usize; 8]>,
}

impl RankBuckets {
    pub fn new(bucket_count: usize) -> Self {
        let mut slots = Vec::with_capacity(bucket_count);
        slots.resize_with(bucket_count, || None);
        RankBuckets {
            slots,
            touched: SmallVec::new(),
        }
    }

    /// Number of rank slots, fixed at construction.
    pub fn bucket_count(&self) -> usize {
        self.slots.len()
    }

    /// The list at `rank`, created on first access. The slot is remembered
    /// for the next `commit_all`/`rollback_all` sweep.
    pub fn get_or_add(&mut self, rank: usize) -> &mut ScanList {
        if !self.touched.contains(&rank) {
            self.touched.push(rank);
        }
        self.slots[rank].get_or_insert_with(ScanList::new)
    }

    pub fn commit_all(&mut self) {
        for &rank in &self.touched {
            if let Some(list) = self.slots[rank].as_mut() {
                list.commit();
            }
        }
        self.touched.clear();
    }

    pub fn rollback_all(&mut self) {
        for &rank in &self.touched {
            if let Some(list) = self.slots[rank].as_mut() {
                list.rollback();
            }
        }
        self.touched.clear();
    }

    /// Removes and returns the lowest-priority slot. Entities in it are folded
    /// after all higher-priority groups.
    pub fn take_lowest(&mut self) -> Vec<Entity> {
        match self.slots.last_mut().and_then(Option::take) {
            Some(mut list) => list.take_items(),
            None => Vec::new(),
        }
    }

    /// Concatenates the remaining slots from rank 0 downward in priority.
    pub fn concat(&mut self) -> Vec<Entity> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            if let Some(list) = slot.as_mut() {
                out.append(&mut list.take_items());
            }
        }
        out
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.touched.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;

    fn num(v: f64) -> Entity {
        Entity::num(v, '+')
    }

    fn values(entities: &[Entity]) -> Vec<f64> {
        entities
            .iter()
            .map(|e| match e.kind() {
                EntityKind::Num(v) => *v,
                _ => panic!("expected literal"),
            })
            .collect()
    }

    #[test]
    fn rollback_keeps_committed_entities() {
        let mut list = ScanList::new();
        list.push(num(1.0));
        list.commit();
        list.push(num(2.0));
        list.push(num(3.0));
        list.rollback();
        assert_eq!(values(&list.take_items()), vec![1.0]);
    }

    #[test]
    fn push_committed_survives_rollback() {
        let mut list = ScanList::new();
        list.push_committed(num(1.0));
        list.push(num(2.0));
        list.rollback();
        assert_eq!(values(&list.take_items()), vec![1.0]);
    }

    #[test]
    fn pop_last_shrinks_uncommitted_count() {
        let mut list = ScanList::new();
        list.push(num(1.0));
        list.commit();
        list.push(num(2.0));
        assert!(list.pop_last().is_some());
        list.rollback();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn sweep_only_visits_touched_slots() {
        let mut buckets = RankBuckets::new(3);
        buckets.get_or_add(0).push(num(1.0));
        buckets.commit_all();
        buckets.get_or_add(0).push(num(2.0));
        buckets.get_or_add(2).push(num(3.0));
        buckets.rollback_all();
        assert_eq!(buckets.get_or_add(0).len(), 1);
        assert!(buckets.get_or_add(2).is_empty());
    }

    #[test]
    fn take_lowest_then_concat() {
        let mut buckets = RankBuckets::new(2);
        buckets.get_or_add(0).push(num(1.0));
        buckets.get_or_add(1).push(num(2.0));
        buckets.commit_all();
        assert_eq!(values(&buckets.take_lowest()), vec![2.0]);
        assert_eq!(values(&buckets.concat()), vec![1.0]);
        assert!(buckets.take_lowest().is_empty());
    }
}
