//! Post-authentication destination resolution.
//!
//! A verified identity lands on exactly one route. Role sources are consulted
//! in fixed priority order, first match wins, and an unreachable source is
//! skipped rather than failing the whole resolution.

use serde::Serialize;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::directory::{Directory, RoleSource};

/// The single resolved landing destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Admin,
    Door,
    Venue,
    Organizer,
    Promoter,
    Performer,
    Attendee,
}

impl Destination {
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Destination::Admin => "/admin",
            Destination::Door => "/door",
            Destination::Venue => "/venue",
            Destination::Organizer => "/organizer",
            Destination::Promoter => "/promoter",
            Destination::Performer => "/performer",
            Destination::Attendee => "/events",
        }
    }

    /// Everything but the attendee default is staff-bound.
    #[must_use]
    pub fn staff_bound(self) -> bool {
        self != Destination::Attendee
    }
}

/// Affiliation sources in resolution order. How many rows match beyond
/// existence is irrelevant; the first source with any row wins.
pub const PRIORITY: [(RoleSource, Destination); 6] = [
    (RoleSource::Operator, Destination::Admin),
    (RoleSource::DoorCrew, Destination::Door),
    (RoleSource::VenueStaff, Destination::Venue),
    (RoleSource::OrganizerStaff, Destination::Organizer),
    (RoleSource::Promoter, Destination::Promoter),
    (RoleSource::Performer, Destination::Performer),
];

/// A resolved landing: the winning destination plus the concrete path,
/// which may be a verbatim caller override.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Landing {
    pub destination: Destination,
    pub path: String,
}

impl Landing {
    fn from_destination(destination: Destination) -> Self {
        Self {
            destination,
            path: destination.path().to_string(),
        }
    }
}

/// Match a caller-supplied override against the privileged route prefixes.
/// Unrecognized paths are ignored and affiliation resolution applies.
fn privileged_override(path: &str) -> Option<Destination> {
    PRIORITY
        .iter()
        .map(|(_, destination)| *destination)
        .find(|destination| path.starts_with(destination.path()))
}

pub struct RoleResolver {
    directory: Arc<dyn Directory>,
}

impl RoleResolver {
    #[must_use]
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Resolve the landing for a verified identity.
    ///
    /// An override path bypasses all affiliation checks when it is recognized
    /// as privileged; otherwise sources are checked in [`PRIORITY`] order and
    /// any lookup failure falls through to the next level.
    #[instrument(skip(self))]
    pub async fn resolve(&self, user_id: Uuid, override_path: Option<&str>) -> Landing {
        if let Some(path) = override_path {
            if let Some(destination) = privileged_override(path) {
                return Landing {
                    destination,
                    path: path.to_string(),
                };
            }
        }
        for (source, destination) in PRIORITY {
            match self.directory.exists_in(source, user_id).await {
                Ok(true) => return Landing::from_destination(destination),
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        "Skipping unreachable role source {}: {err}",
                        source.as_str()
                    );
                }
            }
        }
        Landing::from_destination(Destination::Attendee)
    }
}
