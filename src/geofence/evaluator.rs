use crate::geo::distance_m;
use crate::geofence::config::GeofenceConfig;
use crate::models::{SiteStatus, WorkSite};

/// Where a position stands relative to the configured fences.
#[derive(Debug, Clone, PartialEq)]
pub enum Containment {
    /// Inside a fence's nominal radius.
    Inside(WorkSite),
    /// Outside the active fence's nominal radius but within its expanded
    /// (hysteresis) radius; treated as still inside.
    Hysteresis(WorkSite),
    Outside,
}

impl Containment {
    pub fn fence(&self) -> Option<&WorkSite> {
        match self {
            Containment::Inside(site) | Containment::Hysteresis(site) => Some(site),
            Containment::Outside => None,
        }
    }

    /// Inside for decision purposes; the hysteresis zone counts as inside.
    pub fn is_inside(&self) -> bool {
        !matches!(self, Containment::Outside)
    }
}

/// Stateless containment checks with asymmetric enter/exit radii. GPS jitter
/// near a boundary would otherwise produce enter/exit ping-pong.
pub struct GeofenceEvaluator {
    hysteresis_factor: f64,
}

impl GeofenceEvaluator {
    pub fn new(config: &GeofenceConfig) -> Self {
        Self {
            hysteresis_factor: config.hysteresis_factor,
        }
    }

    /// Entry test: nominal radius only.
    pub fn find_containing_fence<'a>(
        &self,
        latitude: f64,
        longitude: f64,
        fences: &'a [WorkSite],
    ) -> Option<&'a WorkSite> {
        fences
            .iter()
            .filter(|site| site.status == SiteStatus::Active)
            .find(|site| {
                distance_m(latitude, longitude, site.latitude, site.longitude) <= site.radius_m
            })
    }

    /// Exit test for the currently active fence: only past the expanded
    /// radius does the position count as outside.
    pub fn is_outside_expanded(&self, latitude: f64, longitude: f64, fence: &WorkSite) -> bool {
        let d = distance_m(latitude, longitude, fence.latitude, fence.longitude);
        d > fence.radius_m * self.hysteresis_factor
    }

    /// Full containment picture. Nominal containment in any fence wins over
    /// hysteresis on a previously active different fence.
    pub fn evaluate(
        &self,
        latitude: f64,
        longitude: f64,
        fences: &[WorkSite],
        active_fence_id: Option<&str>,
    ) -> Containment {
        if let Some(site) = self.find_containing_fence(latitude, longitude, fences) {
            return Containment::Inside(site.clone());
        }

        if let Some(active_id) = active_fence_id {
            if let Some(active) = fences
                .iter()
                .find(|site| site.id == active_id && site.status == SiteStatus::Active)
            {
                if !self.is_outside_expanded(latitude, longitude, active) {
                    return Containment::Hysteresis(active.clone());
                }
            }
        }

        Containment::Outside
    }

    /// Re-validates a native exit callback. Native exits can fire right at
    /// the nominal boundary; while still within the expanded radius the
    /// event is discarded.
    pub fn confirms_exit(&self, latitude: f64, longitude: f64, fence: &WorkSite) -> bool {
        self.is_outside_expanded(latitude, longitude, fence)
    }
}
