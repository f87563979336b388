//! Wire types for the dispatch API and its push channel.
//!
//! Field identifiers intentionally match the server's Spanish JSON keys so
//! the serde derives describe the wire exactly. Conversion into the English
//! [`crate::domain`] aggregates happens here, at the boundary, so everything
//! past this module can assume well-typed input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Guide, GuideId, GuideState, Invoice, Trip, TripId, TripStatus};

/// One trip as returned by `GET /viajes/activos`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripRecord {
    pub viaje_id: TripId,
    pub numero_vehiculo: String,
    pub conductor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estado_viaje: Option<i64>,
    #[serde(default)]
    pub facturas: Vec<InvoiceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub numero_factura: String,
    #[serde(default)]
    pub guias: Vec<GuideRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuideRecord {
    pub guia_id: GuideId,
    pub numero_guia: String,
    pub estado_id: GuideState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_entrega: Option<DateTime<Utc>>,
}

/// The snapshot endpoint answers either a bare array or a `{success, data}`
/// wrapper depending on the API version; both must be accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SnapshotResponse {
    Wrapped { success: bool, data: Vec<TripRecord> },
    Bare(Vec<TripRecord>),
}

impl SnapshotResponse {
    pub fn into_records(self) -> Vec<TripRecord> {
        match self {
            Self::Wrapped { data, .. } => data,
            Self::Bare(records) => records,
        }
    }
}

/// Push-channel frame: `{"event": <name>, "data": {...}}`.
///
/// A closed union of every event the monitor recognizes. Frames with any
/// other event name fail deserialization and are reported by the transport,
/// never handed to the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum DispatchEvent {
    #[serde(rename = "guia:estado_actualizado")]
    GuideStateChanged(GuideStateChanged),
    #[serde(rename = "viaje:progreso_actualizado")]
    ProgressUpdated(ProgressUpdated),
    #[serde(rename = "viaje:completado")]
    TripCompleted(TripCompleted),
    #[serde(rename = "viaje:estado_actualizado")]
    TripStatusChanged(TripStatusChanged),
    #[serde(rename = "factura:guia_asignada")]
    GuideAssigned(GuideAssigned),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuideStateChanged {
    pub guia_id: GuideId,
    pub estado_id: GuideState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_entrega: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressUpdated {
    pub viaje_id: TripId,
    pub guias_entregadas: u32,
    pub guias_no_entregadas: u32,
    pub total_guias: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripCompleted {
    pub viaje_id: TripId,
    pub guias_entregadas: u32,
    pub guias_no_entregadas: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripStatusChanged {
    pub viaje_id: TripId,
    pub estado_viaje: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuideAssigned {
    pub numero_factura: String,
    pub guia_id: GuideId,
    pub numero_guia: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estado_id: Option<GuideState>,
}

impl From<GuideRecord> for Guide {
    fn from(record: GuideRecord) -> Self {
        Self {
            guide_id: record.guia_id,
            guide_number: record.numero_guia,
            state: record.estado_id,
            delivered_at: record.fecha_entrega,
        }
    }
}

impl From<InvoiceRecord> for Invoice {
    fn from(record: InvoiceRecord) -> Self {
        Self {
            invoice_number: record.numero_factura,
            guides: record.guias.into_iter().map(Guide::from).collect(),
        }
    }
}

impl From<TripRecord> for Trip {
    fn from(record: TripRecord) -> Self {
        let mut trip = Trip {
            trip_id: record.viaje_id,
            vehicle_number: record.numero_vehiculo,
            driver_name: record.conductor,
            status: TripStatus::NoGuides,
            invoices: record.facturas.into_iter().map(Invoice::from).collect(),
            total_guides: 0,
            delivered_guides: 0,
            undelivered_guides: 0,
            pending_guides: 0,
            progress_percent: 0,
        };
        trip.recompute_counters();
        trip.status = record
            .estado_viaje
            .and_then(TripStatus::from_code)
            .unwrap_or_else(|| {
                TripStatus::derive(
                    trip.total_guides,
                    trip.delivered_guides,
                    trip.undelivered_guides,
                )
            });
        trip
    }
}
