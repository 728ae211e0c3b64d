use super::*;
use crate::model::EntityKind;

fn table(name: &str) -> EntityId {
    EntityId::new(EntityKind::Table, "dbo", name)
}

#[test]
fn new_tracker_is_clean() {
    let tracker = ChangeTracker::default();
    assert!(!tracker.has_unsaved_changes());
    assert_eq!(tracker.state(&table("Customer")), ChangeState::Unchanged);
    assert!(tracker.changes().is_empty());
}

#[test]
fn modification_flips_unsaved_flag() {
    let mut tracker = ChangeTracker::default();
    tracker.mark_modified(table("Customer"));

    assert!(tracker.has_unsaved_changes());
    assert_eq!(tracker.state(&table("Customer")), ChangeState::Modified);
    assert_eq!(tracker.dirty_count(), 1);

    tracker.accept_all_changes();
    assert!(!tracker.has_unsaved_changes());
    assert_eq!(tracker.state(&table("Customer")), ChangeState::Unchanged);
}

#[test]
fn added_then_modified_stays_added() {
    let mut tracker = ChangeTracker::default();
    tracker.mark_added(table("Invoice"));
    tracker.mark_modified(table("Invoice"));

    assert_eq!(tracker.state(&table("Invoice")), ChangeState::Added);
    assert_eq!(tracker.dirty_count(), 1);
}

#[test]
fn added_then_removed_cancels_out() {
    let mut tracker = ChangeTracker::default();
    tracker.mark_added(table("Scratch"));
    tracker.mark_removed(table("Scratch"));

    assert_eq!(tracker.state(&table("Scratch")), ChangeState::Unchanged);
    assert!(!tracker.has_unsaved_changes());
}

#[test]
fn removed_then_added_becomes_modified() {
    let mut tracker = ChangeTracker::default();
    tracker.mark_removed(table("Customer"));
    tracker.mark_added(table("Customer"));

    assert_eq!(tracker.state(&table("Customer")), ChangeState::Modified);
    assert_eq!(tracker.dirty_count(), 1);
}

#[test]
fn change_set_partitions_upserts_and_removals() {
    let mut tracker = ChangeTracker::default();
    tracker.mark_added(table("B"));
    tracker.mark_modified(table("A"));
    tracker.mark_removed(table("C"));
    tracker.mark_header_modified();

    let changes = tracker.changes();
    assert_eq!(changes.upserted, vec![table("A"), table("B")]);
    assert_eq!(changes.removed, vec![table("C")]);
    assert!(changes.header_modified);
    assert_eq!(tracker.dirty_count(), 3);
}

#[test]
fn header_change_alone_counts_as_unsaved() {
    let mut tracker = ChangeTracker::default();
    tracker.mark_header_modified();
    assert!(tracker.has_unsaved_changes());
    assert_eq!(tracker.dirty_count(), 0);
}
