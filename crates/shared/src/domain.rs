use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(TripId);
id_newtype!(GuideId);

/// Delivery state of a single guide.
///
/// The server emits opaque integer codes; the three codes observed in
/// production are mapped to named variants, everything else is carried
/// through untouched so unknown codes survive a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum GuideState {
    Assigned,
    Delivered,
    NotDelivered,
    Other(i64),
}

impl From<i64> for GuideState {
    fn from(code: i64) -> Self {
        match code {
            3 => Self::Assigned,
            4 => Self::Delivered,
            5 => Self::NotDelivered,
            other => Self::Other(other),
        }
    }
}

impl From<GuideState> for i64 {
    fn from(state: GuideState) -> Self {
        match state {
            GuideState::Assigned => 3,
            GuideState::Delivered => 4,
            GuideState::NotDelivered => 5,
            GuideState::Other(code) => code,
        }
    }
}

/// Trip status as shown on the dashboard.
///
/// Not authoritative client-side: the monitor derives it from guide counts
/// unless the server has supplied an explicit status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Preparing,
    NoGuides,
    InRoute,
    Completed,
}

impl TripStatus {
    /// Maps a server `estado_viaje` code. Unknown codes yield `None` and the
    /// caller falls back to [`TripStatus::derive`].
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Preparing),
            2 => Some(Self::NoGuides),
            3 => Some(Self::InRoute),
            4 => Some(Self::Completed),
            _ => None,
        }
    }

    /// Derives a status from guide counts alone.
    pub fn derive(total: u32, delivered: u32, undelivered: u32) -> Self {
        let resolved = delivered + undelivered;
        if total == 0 {
            Self::NoGuides
        } else if resolved >= total {
            Self::Completed
        } else if resolved > 0 {
            Self::InRoute
        } else {
            Self::Preparing
        }
    }
}

/// A single delivery-remission document. `guide_id` is globally unique and
/// is the join key used by incoming push events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guide {
    pub guide_id: GuideId,
    pub guide_number: String,
    pub state: GuideState,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// A billing document assigned to a trip. Owns its guides exclusively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_number: String,
    pub guides: Vec<Guide>,
}

impl Invoice {
    pub fn contains_guide(&self, guide_id: GuideId) -> bool {
        self.guides.iter().any(|g| g.guide_id == guide_id)
    }
}

/// One vehicle dispatch run, the aggregate root held by the reconciler.
///
/// The counter fields are derived: they are recomputed by scanning the guide
/// lists after every accepted mutation, except where a server-computed
/// summary event overwrites them directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub trip_id: TripId,
    pub vehicle_number: String,
    pub driver_name: String,
    pub status: TripStatus,
    pub invoices: Vec<Invoice>,
    pub total_guides: u32,
    pub delivered_guides: u32,
    pub undelivered_guides: u32,
    pub pending_guides: u32,
    pub progress_percent: u8,
}

impl Trip {
    /// Recomputes every derived counter by scanning the guide lists. Status
    /// is deliberately left alone: it only changes through snapshot loads
    /// and the trip-status / trip-completed events.
    pub fn recompute_counters(&mut self) {
        let mut total = 0u32;
        let mut delivered = 0u32;
        let mut undelivered = 0u32;
        for invoice in &self.invoices {
            for guide in &invoice.guides {
                total += 1;
                match guide.state {
                    GuideState::Delivered => delivered += 1,
                    GuideState::NotDelivered => undelivered += 1,
                    GuideState::Assigned | GuideState::Other(_) => {}
                }
            }
        }
        self.total_guides = total;
        self.delivered_guides = delivered;
        self.undelivered_guides = undelivered;
        self.recompute_progress();
    }

    /// Recomputes `pending_guides` and `progress_percent` from whatever the
    /// counter fields currently hold. Used after a server summary overwrote
    /// the counters directly, bypassing guide-list derivation.
    pub fn recompute_progress(&mut self) {
        let resolved = self.delivered_guides + self.undelivered_guides;
        self.pending_guides = self.total_guides.saturating_sub(resolved);
        self.progress_percent = if self.total_guides == 0 {
            0
        } else {
            let percent = 100.0 * f64::from(resolved) / f64::from(self.total_guides);
            percent.round().min(100.0) as u8
        };
    }

    pub fn contains_guide(&self, guide_id: GuideId) -> bool {
        self.invoices
            .iter()
            .any(|invoice| invoice.contains_guide(guide_id))
    }

    pub fn contains_invoice(&self, invoice_number: &str) -> bool {
        self.invoices
            .iter()
            .any(|invoice| invoice.invoice_number == invoice_number)
    }

    pub fn find_guide_mut(&mut self, guide_id: GuideId) -> Option<&mut Guide> {
        self.invoices
            .iter_mut()
            .flat_map(|invoice| invoice.guides.iter_mut())
            .find(|guide| guide.guide_id == guide_id)
    }

    pub fn find_invoice_mut(&mut self, invoice_number: &str) -> Option<&mut Invoice> {
        self.invoices
            .iter_mut()
            .find(|invoice| invoice.invoice_number == invoice_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guide_state_codes_round_trip() {
        assert_eq!(GuideState::from(3), GuideState::Assigned);
        assert_eq!(GuideState::from(4), GuideState::Delivered);
        assert_eq!(GuideState::from(5), GuideState::NotDelivered);
        assert_eq!(GuideState::from(9), GuideState::Other(9));
        assert_eq!(i64::from(GuideState::Other(9)), 9);

        let json = serde_json::to_string(&GuideState::Delivered).unwrap();
        assert_eq!(json, "4");
        let back: GuideState = serde_json::from_str("7").unwrap();
        assert_eq!(back, GuideState::Other(7));
    }

    #[test]
    fn status_derivation_from_counts() {
        assert_eq!(TripStatus::derive(0, 0, 0), TripStatus::NoGuides);
        assert_eq!(TripStatus::derive(4, 0, 0), TripStatus::Preparing);
        assert_eq!(TripStatus::derive(4, 1, 0), TripStatus::InRoute);
        assert_eq!(TripStatus::derive(4, 3, 1), TripStatus::Completed);
    }

    #[test]
    fn progress_rounds_to_nearest_integer() {
        let mut trip = Trip {
            trip_id: TripId(1),
            vehicle_number: "V-01".into(),
            driver_name: "driver".into(),
            status: TripStatus::InRoute,
            invoices: Vec::new(),
            total_guides: 3,
            delivered_guides: 1,
            undelivered_guides: 0,
            pending_guides: 0,
            progress_percent: 0,
        };
        trip.recompute_progress();
        assert_eq!(trip.progress_percent, 33);
        assert_eq!(trip.pending_guides, 2);

        trip.delivered_guides = 2;
        trip.recompute_progress();
        assert_eq!(trip.progress_percent, 67);
    }
}
