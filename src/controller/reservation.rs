//! Elastic IP reservation lookup

use super::ReconcileError;
use crate::cloud::{IpReservation, ReservationService};
use tracing::error;

/// First reservation carrying every tag in `tags`
pub fn reservation_by_all_tags<'a>(
    tags: &[String],
    reservations: &'a [IpReservation],
) -> Option<&'a IpReservation> {
    reservations.iter().find(|r| r.has_all_tags(tags))
}

/// Find the reservation tagged `tag` in the project
///
/// Lists fresh on every call since assignments change out of band.
/// Returns `Ok(None)` when nothing matches.
pub async fn resolve_reservation(
    reservations: &dyn ReservationService,
    project_id: &str,
    tag: &str,
) -> Result<Option<IpReservation>, ReconcileError> {
    if tag.is_empty() {
        return Err(ReconcileError::EmptyTag);
    }

    let list = reservations
        .list_reservations(project_id)
        .await
        .map_err(ReconcileError::ReservationLookup)?;

    let tags = [tag.to_string()];
    Ok(reservation_by_all_tags(&tags, &list).cloned())
}

/// Reject reservations assigned to more than one device
pub fn ensure_single_assignment(reservation: &IpReservation) -> Result<(), ReconcileError> {
    if reservation.assignments.len() > 1 {
        error!(
            reservation = %reservation.id,
            address = %reservation.address,
            assignments = reservation.assignments.len(),
            "Elastic IP has more than one assignment"
        );
        return Err(ReconcileError::MultipleAssignments {
            id: reservation.id.clone(),
        });
    }
    Ok(())
}
