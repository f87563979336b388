//! Incremental trip-state reconciliation.
//!
//! [`TripStateReconciler`] keeps a client-local mapping of trip aggregates
//! consistent with the server of record, given one authoritative snapshot
//! load and an unordered, at-least-once stream of partial update events.
//!
//! Every `apply_*` operation is total: it either mutates state or is a
//! silent no-op. Events routinely reference trips, invoices, or guides that
//! fall outside the currently loaded window (the push channel has no notion
//! of the client's filter), so an unknown reference is not an error. The one
//! fallible path is [`TripStateReconciler::load_snapshot`], the
//! authority-refresh primitive, which rejects malformed input outright
//! rather than half-applying it.

use std::collections::{HashMap, HashSet};

use shared::{
    domain::{Guide, GuideId, GuideState, Trip, TripId, TripStatus},
    protocol::{
        DispatchEvent, GuideAssigned, GuideStateChanged, ProgressUpdated, TripCompleted,
        TripStatusChanged,
    },
};
use thiserror::Error;
use tracing::debug;

/// Snapshot input that would corrupt the mapping if applied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot contains trip {0} more than once")]
    DuplicateTrip(TripId),
    #[error("snapshot contains guide {0} more than once")]
    DuplicateGuide(GuideId),
}

/// Whether an event changed the mapping or was dropped as a stale reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Ignored,
}

impl ApplyOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// In-memory mapping of trip id to trip aggregate.
///
/// Trips are stored in the order of the last snapshot load; events never
/// reorder them. Single logical writer, synchronous methods, no interior
/// resources to release.
#[derive(Debug, Default)]
pub struct TripStateReconciler {
    trips: Vec<Trip>,
    index: HashMap<TripId, usize>,
}

impl TripStateReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the entire mapping with the given trips, preserving their
    /// order. Counters are re-derived for every trip so reads reflect
    /// exactly the input.
    ///
    /// Rejects input with a duplicate trip id or a guide id appearing in
    /// more than one place; on rejection the prior mapping is untouched.
    pub fn load_snapshot(&mut self, mut trips: Vec<Trip>) -> Result<(), SnapshotError> {
        let mut index = HashMap::with_capacity(trips.len());
        let mut seen_guides = HashSet::new();
        for (pos, trip) in trips.iter().enumerate() {
            if index.insert(trip.trip_id, pos).is_some() {
                return Err(SnapshotError::DuplicateTrip(trip.trip_id));
            }
            for invoice in &trip.invoices {
                for guide in &invoice.guides {
                    if !seen_guides.insert(guide.guide_id) {
                        return Err(SnapshotError::DuplicateGuide(guide.guide_id));
                    }
                }
            }
        }

        for trip in &mut trips {
            trip.recompute_counters();
        }
        self.trips = trips;
        self.index = index;
        Ok(())
    }

    /// Dispatches one push-channel event to its handler.
    pub fn apply(&mut self, event: &DispatchEvent) -> ApplyOutcome {
        match event {
            DispatchEvent::GuideStateChanged(payload) => self.apply_guide_state_changed(payload),
            DispatchEvent::ProgressUpdated(payload) => self.apply_progress_snapshot(payload),
            DispatchEvent::TripCompleted(payload) => self.apply_trip_completed(payload),
            DispatchEvent::TripStatusChanged(payload) => self.apply_trip_status_changed(payload),
            DispatchEvent::GuideAssigned(payload) => self.apply_invoice_guide_assigned(payload),
        }
    }

    /// Overwrites a guide's state unconditionally (last write wins; the
    /// source offers no ordering metadata), then re-derives the owning
    /// trip's counters.
    pub fn apply_guide_state_changed(&mut self, event: &GuideStateChanged) -> ApplyOutcome {
        let Some(trip) = self
            .trips
            .iter_mut()
            .find(|trip| trip.contains_guide(event.guia_id))
        else {
            debug!(guide_id = event.guia_id.0, "guide not in loaded window, dropping event");
            return ApplyOutcome::Ignored;
        };

        if let Some(guide) = trip.find_guide_mut(event.guia_id) {
            guide.state = event.estado_id;
            if let Some(delivered_at) = event.fecha_entrega {
                guide.delivered_at = Some(delivered_at);
            }
        }
        trip.recompute_counters();
        ApplyOutcome::Applied
    }

    /// Overwrites a trip's counters from a server-computed summary,
    /// bypassing guide-list derivation.
    pub fn apply_progress_snapshot(&mut self, event: &ProgressUpdated) -> ApplyOutcome {
        let Some(trip) = self.trip_mut(event.viaje_id) else {
            return ApplyOutcome::Ignored;
        };
        trip.delivered_guides = event.guias_entregadas;
        trip.undelivered_guides = event.guias_no_entregadas;
        trip.total_guides = event.total_guias;
        trip.recompute_progress();
        ApplyOutcome::Applied
    }

    /// Marks a trip completed and overwrites its final counters.
    pub fn apply_trip_completed(&mut self, event: &TripCompleted) -> ApplyOutcome {
        let Some(trip) = self.trip_mut(event.viaje_id) else {
            return ApplyOutcome::Ignored;
        };
        trip.status = TripStatus::Completed;
        trip.delivered_guides = event.guias_entregadas;
        trip.undelivered_guides = event.guias_no_entregadas;
        trip.recompute_progress();
        ApplyOutcome::Applied
    }

    /// Overwrites a trip's status. No transition-validity checking: the
    /// server is authoritative and any status may follow any other.
    pub fn apply_trip_status_changed(&mut self, event: &TripStatusChanged) -> ApplyOutcome {
        let Some(trip) = self.trip_mut(event.viaje_id) else {
            return ApplyOutcome::Ignored;
        };
        let Some(status) = TripStatus::from_code(event.estado_viaje) else {
            debug!(
                trip_id = event.viaje_id.0,
                code = event.estado_viaje,
                "unknown trip status code, dropping event"
            );
            return ApplyOutcome::Ignored;
        };
        trip.status = status;
        ApplyOutcome::Applied
    }

    /// Appends a newly assigned guide to its invoice. Replaying the same
    /// assignment is a no-op: the guide id acts as the duplicate guard, so
    /// an at-least-once channel can never create the guide twice.
    pub fn apply_invoice_guide_assigned(&mut self, event: &GuideAssigned) -> ApplyOutcome {
        let Some(trip) = self
            .trips
            .iter_mut()
            .find(|trip| trip.contains_invoice(&event.numero_factura))
        else {
            debug!(
                invoice = %event.numero_factura,
                "invoice not in loaded window, dropping event"
            );
            return ApplyOutcome::Ignored;
        };

        if let Some(invoice) = trip.find_invoice_mut(&event.numero_factura) {
            if invoice.contains_guide(event.guia_id) {
                debug!(guide_id = event.guia_id.0, "duplicate assignment, dropping event");
                return ApplyOutcome::Ignored;
            }
            invoice.guides.push(Guide {
                guide_id: event.guia_id,
                guide_number: event.numero_guia.clone(),
                state: event.estado_id.unwrap_or(GuideState::Assigned),
                delivered_at: None,
            });
        }
        trip.recompute_counters();
        ApplyOutcome::Applied
    }

    /// Current mapping, in the order of the last snapshot load.
    pub fn snapshot(&self) -> &[Trip] {
        &self.trips
    }

    pub fn trip(&self, trip_id: TripId) -> Option<&Trip> {
        self.index.get(&trip_id).map(|&pos| &self.trips[pos])
    }

    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }

    fn trip_mut(&mut self, trip_id: TripId) -> Option<&mut Trip> {
        let pos = *self.index.get(&trip_id)?;
        self.trips.get_mut(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shared::domain::Invoice;

    fn guide(id: i64, state: GuideState) -> Guide {
        Guide {
            guide_id: GuideId(id),
            guide_number: format!("G-{id}"),
            state,
            delivered_at: None,
        }
    }

    fn trip(id: i64, invoices: Vec<Invoice>) -> Trip {
        Trip {
            trip_id: TripId(id),
            vehicle_number: format!("V-{id}"),
            driver_name: "driver".into(),
            status: TripStatus::Preparing,
            invoices,
            total_guides: 0,
            delivered_guides: 0,
            undelivered_guides: 0,
            pending_guides: 0,
            progress_percent: 0,
        }
    }

    fn invoice(number: &str, guides: Vec<Guide>) -> Invoice {
        Invoice {
            invoice_number: number.into(),
            guides,
        }
    }

    fn loaded_reconciler() -> TripStateReconciler {
        let mut reconciler = TripStateReconciler::new();
        reconciler
            .load_snapshot(vec![
                trip(1, vec![invoice("F-1", vec![guide(100, GuideState::Assigned)])]),
                trip(2, vec![invoice("F-2", vec![
                    guide(200, GuideState::Assigned),
                    guide(201, GuideState::Delivered),
                ])]),
            ])
            .unwrap();
        reconciler
    }

    fn assert_counter_invariant(reconciler: &TripStateReconciler) {
        for trip in reconciler.snapshot() {
            assert_eq!(
                trip.delivered_guides + trip.undelivered_guides + trip.pending_guides,
                trip.total_guides,
                "counter invariant broken for trip {}",
                trip.trip_id
            );
            assert!(trip.progress_percent <= 100);
        }
    }

    #[test]
    fn snapshot_load_derives_counters() {
        let reconciler = loaded_reconciler();
        let second = reconciler.trip(TripId(2)).unwrap();
        assert_eq!(second.total_guides, 2);
        assert_eq!(second.delivered_guides, 1);
        assert_eq!(second.pending_guides, 1);
        assert_eq!(second.progress_percent, 50);
        assert_counter_invariant(&reconciler);
    }

    #[test]
    fn snapshot_load_preserves_input_order() {
        let mut reconciler = TripStateReconciler::new();
        reconciler
            .load_snapshot(vec![trip(9, vec![]), trip(3, vec![]), trip(5, vec![])])
            .unwrap();
        let order: Vec<i64> = reconciler.snapshot().iter().map(|t| t.trip_id.0).collect();
        assert_eq!(order, vec![9, 3, 5]);
    }

    #[test]
    fn empty_snapshot_replaces_everything() {
        let mut reconciler = loaded_reconciler();
        reconciler.load_snapshot(Vec::new()).unwrap();
        assert!(reconciler.is_empty());
        assert!(reconciler.snapshot().is_empty());
    }

    #[test]
    fn duplicate_trip_id_rejected_without_touching_state() {
        let mut reconciler = loaded_reconciler();
        let err = reconciler
            .load_snapshot(vec![trip(7, vec![]), trip(7, vec![])])
            .unwrap_err();
        assert_eq!(err, SnapshotError::DuplicateTrip(TripId(7)));
        // Prior mapping survives a rejected refresh.
        assert_eq!(reconciler.snapshot().len(), 2);
        assert!(reconciler.trip(TripId(1)).is_some());
    }

    #[test]
    fn duplicate_guide_id_across_trips_rejected() {
        let mut reconciler = TripStateReconciler::new();
        let err = reconciler
            .load_snapshot(vec![
                trip(1, vec![invoice("F-1", vec![guide(100, GuideState::Assigned)])]),
                trip(2, vec![invoice("F-2", vec![guide(100, GuideState::Assigned)])]),
            ])
            .unwrap_err();
        assert_eq!(err, SnapshotError::DuplicateGuide(GuideId(100)));
        assert!(reconciler.is_empty());
    }

    #[test]
    fn guide_state_change_updates_owning_trip_only() {
        let mut reconciler = loaded_reconciler();
        let delivered_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let outcome = reconciler.apply_guide_state_changed(&GuideStateChanged {
            guia_id: GuideId(100),
            estado_id: GuideState::Delivered,
            fecha_entrega: Some(delivered_at),
        });
        assert!(outcome.is_applied());

        let first = reconciler.trip(TripId(1)).unwrap();
        assert_eq!(first.delivered_guides, 1);
        assert_eq!(first.pending_guides, 0);
        assert_eq!(first.progress_percent, 100);
        assert_eq!(
            first.invoices[0].guides[0].delivered_at,
            Some(delivered_at)
        );

        // Trip 2 untouched.
        let second = reconciler.trip(TripId(2)).unwrap();
        assert_eq!(second.delivered_guides, 1);
        assert_counter_invariant(&reconciler);
    }

    #[test]
    fn last_write_wins_on_guide_state() {
        let mut reconciler = loaded_reconciler();
        reconciler.apply_guide_state_changed(&GuideStateChanged {
            guia_id: GuideId(100),
            estado_id: GuideState::Delivered,
            fecha_entrega: None,
        });
        reconciler.apply_guide_state_changed(&GuideStateChanged {
            guia_id: GuideId(100),
            estado_id: GuideState::NotDelivered,
            fecha_entrega: None,
        });

        let trip = reconciler.trip(TripId(1)).unwrap();
        assert_eq!(trip.invoices[0].guides[0].state, GuideState::NotDelivered);
        assert_eq!(trip.delivered_guides, 0);
        assert_eq!(trip.undelivered_guides, 1);
        assert_counter_invariant(&reconciler);
    }

    #[test]
    fn unknown_references_leave_mapping_unchanged() {
        let mut reconciler = loaded_reconciler();
        let before: Vec<Trip> = reconciler.snapshot().to_vec();

        let outcomes = [
            reconciler.apply_guide_state_changed(&GuideStateChanged {
                guia_id: GuideId(999),
                estado_id: GuideState::Delivered,
                fecha_entrega: None,
            }),
            reconciler.apply_progress_snapshot(&ProgressUpdated {
                viaje_id: TripId(999),
                guias_entregadas: 1,
                guias_no_entregadas: 1,
                total_guias: 2,
            }),
            reconciler.apply_trip_completed(&TripCompleted {
                viaje_id: TripId(999),
                guias_entregadas: 1,
                guias_no_entregadas: 0,
            }),
            reconciler.apply_trip_status_changed(&TripStatusChanged {
                viaje_id: TripId(999),
                estado_viaje: 3,
            }),
            reconciler.apply_invoice_guide_assigned(&GuideAssigned {
                numero_factura: "F-999".into(),
                guia_id: GuideId(999),
                numero_guia: "G-999".into(),
                estado_id: None,
            }),
        ];
        assert!(outcomes.iter().all(|o| *o == ApplyOutcome::Ignored));
        assert_eq!(reconciler.snapshot(), before.as_slice());
    }

    #[test]
    fn assignment_is_idempotent() {
        let mut reconciler = loaded_reconciler();
        let event = GuideAssigned {
            numero_factura: "F-1".into(),
            guia_id: GuideId(101),
            numero_guia: "G-101".into(),
            estado_id: None,
        };
        assert_eq!(reconciler.apply_invoice_guide_assigned(&event), ApplyOutcome::Applied);
        assert_eq!(reconciler.apply_invoice_guide_assigned(&event), ApplyOutcome::Ignored);

        let trip = reconciler.trip(TripId(1)).unwrap();
        let matching: Vec<_> = trip.invoices[0]
            .guides
            .iter()
            .filter(|g| g.guide_id == GuideId(101))
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].state, GuideState::Assigned);
        assert_eq!(trip.total_guides, 2);
        assert_counter_invariant(&reconciler);
    }

    #[test]
    fn progress_snapshot_overwrites_derived_counters() {
        let mut reconciler = loaded_reconciler();
        let outcome = reconciler.apply_progress_snapshot(&ProgressUpdated {
            viaje_id: TripId(1),
            guias_entregadas: 4,
            guias_no_entregadas: 1,
            total_guias: 10,
        });
        assert!(outcome.is_applied());

        let trip = reconciler.trip(TripId(1)).unwrap();
        assert_eq!(trip.delivered_guides, 4);
        assert_eq!(trip.undelivered_guides, 1);
        assert_eq!(trip.total_guides, 10);
        assert_eq!(trip.pending_guides, 5);
        assert_eq!(trip.progress_percent, 50);
        assert_counter_invariant(&reconciler);
    }

    #[test]
    fn trip_completed_sets_status_and_counters() {
        let mut reconciler = loaded_reconciler();
        reconciler.apply_trip_completed(&TripCompleted {
            viaje_id: TripId(2),
            guias_entregadas: 1,
            guias_no_entregadas: 1,
        });
        let trip = reconciler.trip(TripId(2)).unwrap();
        assert_eq!(trip.status, TripStatus::Completed);
        assert_eq!(trip.progress_percent, 100);
        assert_eq!(trip.pending_guides, 0);
    }

    #[test]
    fn status_change_overwrites_status_only() {
        let mut reconciler = loaded_reconciler();
        let before = reconciler.trip(TripId(1)).unwrap().clone();
        reconciler.apply_trip_status_changed(&TripStatusChanged {
            viaje_id: TripId(1),
            estado_viaje: 4,
        });
        let after = reconciler.trip(TripId(1)).unwrap();
        assert_eq!(after.status, TripStatus::Completed);
        assert_eq!(after.total_guides, before.total_guides);
        assert_eq!(after.delivered_guides, before.delivered_guides);
        assert_eq!(after.invoices, before.invoices);
    }

    #[test]
    fn unknown_status_code_is_ignored() {
        let mut reconciler = loaded_reconciler();
        let outcome = reconciler.apply_trip_status_changed(&TripStatusChanged {
            viaje_id: TripId(1),
            estado_viaje: 42,
        });
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(reconciler.trip(TripId(1)).unwrap().status, TripStatus::Preparing);
    }

    // The end-to-end sequence from the dashboard's busiest path: an invoice
    // starts empty, a guide is assigned, then delivered.
    #[test]
    fn assign_then_deliver_drives_progress_to_completion() {
        let mut reconciler = TripStateReconciler::new();
        reconciler
            .load_snapshot(vec![trip(1, vec![invoice("F-1", vec![])])])
            .unwrap();

        reconciler.apply(&DispatchEvent::GuideAssigned(GuideAssigned {
            numero_factura: "F-1".into(),
            guia_id: GuideId(100),
            numero_guia: "G-100".into(),
            estado_id: None,
        }));
        {
            let trip = reconciler.trip(TripId(1)).unwrap();
            assert_eq!(trip.total_guides, 1);
            assert_eq!(trip.pending_guides, 1);
            assert_eq!(trip.progress_percent, 0);
        }

        reconciler.apply(&DispatchEvent::GuideStateChanged(GuideStateChanged {
            guia_id: GuideId(100),
            estado_id: GuideState::Delivered,
            fecha_entrega: None,
        }));
        let trip = reconciler.trip(TripId(1)).unwrap();
        assert_eq!(trip.delivered_guides, 1);
        assert_eq!(trip.pending_guides, 0);
        assert_eq!(trip.progress_percent, 100);
        assert_counter_invariant(&reconciler);
    }

    #[test]
    fn one_of_three_resolved_rounds_down_to_33() {
        let mut reconciler = TripStateReconciler::new();
        reconciler
            .load_snapshot(vec![trip(
                1,
                vec![invoice("F-1", vec![
                    guide(1, GuideState::Delivered),
                    guide(2, GuideState::Assigned),
                    guide(3, GuideState::Assigned),
                ])],
            )])
            .unwrap();
        assert_eq!(reconciler.trip(TripId(1)).unwrap().progress_percent, 33);
    }

    #[test]
    fn counter_invariant_holds_across_mixed_event_sequence() {
        let mut reconciler = loaded_reconciler();
        let events = vec![
            DispatchEvent::GuideAssigned(GuideAssigned {
                numero_factura: "F-2".into(),
                guia_id: GuideId(202),
                numero_guia: "G-202".into(),
                estado_id: None,
            }),
            DispatchEvent::GuideStateChanged(GuideStateChanged {
                guia_id: GuideId(200),
                estado_id: GuideState::NotDelivered,
                fecha_entrega: None,
            }),
            DispatchEvent::ProgressUpdated(ProgressUpdated {
                viaje_id: TripId(1),
                guias_entregadas: 0,
                guias_no_entregadas: 0,
                total_guias: 1,
            }),
            DispatchEvent::GuideStateChanged(GuideStateChanged {
                guia_id: GuideId(100),
                estado_id: GuideState::Other(8),
                fecha_entrega: None,
            }),
            DispatchEvent::TripCompleted(TripCompleted {
                viaje_id: TripId(2),
                guias_entregadas: 2,
                guias_no_entregadas: 1,
            }),
        ];
        for event in &events {
            reconciler.apply(event);
            assert_counter_invariant(&reconciler);
        }
    }
}
