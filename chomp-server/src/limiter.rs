//! Minimal fixed-window request-count rate limiter (SPEC_FULL.md §2).
//! Grounded on the existence of
//! `examples/original_source/src/server/middlewares/limiter.py`'s
//! `Limiter` middleware (request/bandwidth/points buckets) — the exact
//! multi-bucket algorithm isn't retained by the retained index, so this
//! keeps only its request-count buckets (`rpm`/`rph`/`rpd`), matching the
//! thresholds in the Python source's `DEFAULT_LIMITS`. Deliberately minimal
//! since the server is a boundary component (spec.md §1).

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::Request;

use crate::state::AppState;

/// `(bucket name, cap, window seconds)`.
pub const BUCKETS: [(&str, i64, u64); 3] = [("rpm", 60, 60), ("rph", 1200, 3600), ("rpd", 9600, 86400)];

pub fn requester_id(req: &Request<'_>) -> String {
    req.client_ip().map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".to_string())
}

/// A request guard that increments every bucket for the requester and
/// rejects with 429 if any cap is exceeded. Attaching it to a route's
/// signature applies the limiter to that route only, matching the Python
/// source's per-route `@limit(points=N)` decorator (minus the points
/// weighting, which this simplification drops).
pub struct RateLimit;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RateLimit {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(state) = req.rocket().state::<AppState>() else {
            return Outcome::Success(RateLimit);
        };
        let user = requester_id(req);

        for (bucket, cap, ttl) in BUCKETS {
            match state.coordination.limiter_increment(bucket, &user, ttl).await {
                Ok(count) if count > cap => return Outcome::Error((Status::TooManyRequests, ())),
                Ok(_) => {}
                Err(e) => log::warn!("rate limiter check failed for bucket {bucket}: {e}"),
            }
        }
        Outcome::Success(RateLimit)
    }
}
