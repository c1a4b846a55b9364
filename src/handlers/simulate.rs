use axum::Json;
use chrono::{Days, NaiveDate, Utc};
use rand::Rng;
use serde::Serialize;

use super::AppError;

/// Probability of each failure branch, checked in order.
const FAILURE_RATE: f64 = 0.25;
const NOT_FOUND_RATE: f64 = 0.25;

const SUMMARIES: [&str; 10] = [
    "Freezing",
    "Bracing",
    "Chilly",
    "Cool",
    "Mild",
    "Warm",
    "Balmy",
    "Hot",
    "Sweltering",
    "Scorching",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    NotFound,
    Failed,
}

fn pick_outcome(fail_roll: f64, missing_roll: f64) -> Outcome {
    if fail_roll < FAILURE_RATE {
        Outcome::Failed
    } else if missing_roll < NOT_FOUND_RATE {
        Outcome::NotFound
    } else {
        Outcome::Ok
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub date: NaiveDate,
    pub temperature_c: i32,
    pub summary: &'static str,
}

// ─── GET /api/simulate ───────────────────────────────────────────
/// Demo traffic source: fails with 500 a quarter of the time, then 404 a
/// quarter of the remainder, otherwise returns a five-day forecast.

pub async fn simulate() -> Result<Json<Vec<Forecast>>, AppError> {
    let mut rng = rand::thread_rng();
    match pick_outcome(rng.gen(), rng.gen()) {
        Outcome::Failed => Err(AppError::Internal("Simulated server error".into())),
        Outcome::NotFound => Err(AppError::NotFound("Simulated not found".into())),
        Outcome::Ok => {
            let today = Utc::now().date_naive();
            let forecast = (1..=5u64)
                .filter_map(|day| {
                    Some(Forecast {
                        date: today.checked_add_days(Days::new(day))?,
                        temperature_c: rng.gen_range(-20..55),
                        summary: SUMMARIES[rng.gen_range(0..SUMMARIES.len())],
                    })
                })
                .collect();
            Ok(Json(forecast))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn failure_roll_wins_over_not_found() {
        assert_eq!(pick_outcome(0.1, 0.1), Outcome::Failed);
        assert_eq!(pick_outcome(0.5, 0.1), Outcome::NotFound);
        assert_eq!(pick_outcome(0.5, 0.9), Outcome::Ok);
        assert_eq!(pick_outcome(0.25, 0.25), Outcome::Ok);
    }

    #[tokio::test]
    async fn every_outcome_maps_to_a_known_status() {
        for _ in 0..50 {
            let status = simulate().await.into_response().status().as_u16();
            assert!(matches!(status, 200 | 404 | 500), "unexpected {status}");
        }
    }
}
