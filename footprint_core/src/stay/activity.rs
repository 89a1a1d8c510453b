use std::collections::HashMap;

use anyhow::Result;
use time::UtcOffset;

use crate::{
    formatting::{is_weekend, to_local},
    model::{ActivityAnnotation, ActivityType, StayId, StaySegment},
};

const ONE_HOUR: i64 = 3600;
const TWO_HOURS: i64 = 7200;
const FOUR_HOURS: i64 = 14_400;
const ONE_DAY: f64 = 86_400.0;

/// Visits to one place are counted by rounded centre and area name.
pub type LocationKey = (String, i64, i64);

pub fn location_key(stay: &StaySegment, precision: u32) -> LocationKey {
    let scale = 10f64.powi(precision as i32);
    (
        stay.admin.area_name().unwrap_or("").to_string(),
        (stay.center_lat * scale).round() as i64,
        (stay.center_lon * scale).round() as i64,
    )
}

/// Counts the stays at each location.
pub fn visit_frequencies(stays: &[StaySegment], precision: u32) -> HashMap<LocationKey, usize> {
    let mut counts = HashMap::new();
    for stay in stays {
        *counts.entry(location_key(stay, precision)).or_insert(0) += 1;
    }
    counts
}

fn meal_at(hour: u8) -> Option<ActivityType> {
    match hour {
        7..=8 => Some(ActivityType::MealBreakfast),
        11..=12 => Some(ActivityType::MealLunch),
        17..=18 => Some(ActivityType::MealDinner),
        _ => None,
    }
}

/// Infers the activity type and its confidence. The rules are tried in a
/// fixed order and the first that matches wins.
pub fn infer_activity(stay: &StaySegment, frequency: usize, offset: UtcOffset) -> Result<(ActivityType, f64)> {
    let start = to_local(stay.start_time, offset)?;
    let hour = start.hour();
    let weekend = is_weekend(&start);
    let duration = stay.duration_s;

    let night = hour >= 22 || hour < 6;
    let daytime = (9..18).contains(&hour);
    let evening = (18..22).contains(&hour);

    let inferred = if night && duration > FOUR_HOURS && frequency > 10 {
        (ActivityType::Home, 0.9)
    } else if !weekend && daytime && duration > TWO_HOURS && frequency > 5 {
        (ActivityType::Work, 0.8)
    } else if let Some(meal) = meal_at(hour).filter(|_| duration < TWO_HOURS) {
        (meal, 0.7)
    } else if duration < ONE_HOUR {
        (ActivityType::Transit, 0.6)
    } else if (weekend || evening) && duration > ONE_HOUR && duration < FOUR_HOURS {
        (ActivityType::Visit, 0.5)
    } else {
        (ActivityType::Unknown, 0.3)
    };

    Ok(inferred)
}

/// Importance, 0-100, from frequency, duration, recency and the
/// administrative level of the strategy. Recency is measured back from
/// `reference_time` rather than the current clock.
pub fn importance(stay: &StaySegment, frequency: usize, reference_time: i64) -> u8 {
    let freq_score = (frequency as f64 / 20.0).min(1.0) * 40.0;
    let duration_score = (stay.duration_s as f64 / ONE_DAY).min(1.0) * 30.0;
    let days_ago = (reference_time - stay.end_time) as f64 / ONE_DAY;
    let recency_score = (1.0 - days_ago / 365.0).max(0.0) * 20.0;
    let admin_score = stay.strategy.admin_level().importance_weight();

    let score = freq_score + duration_score + recency_score + admin_score;
    score.clamp(0.0, 100.0) as u8
}

pub fn label(stay: &StaySegment, activity: ActivityType) -> String {
    let place = stay.admin.area_name().unwrap_or("Unknown");
    match activity {
        ActivityType::Home => format!("Home in {place}"),
        ActivityType::Work => format!("Work in {place}"),
        ActivityType::Transit => format!("Transit in {place}"),
        ActivityType::Visit => format!("Visit to {place}"),
        ActivityType::MealBreakfast | ActivityType::MealLunch | ActivityType::MealDinner => {
            format!("{} in {place}", activity.meal_name().unwrap_or("Meal"))
        }
        ActivityType::Unknown => format!("Stay in {place}"),
    }
}

/// Annotates every stay of one strategy. Frequencies are counted over the
/// whole set, so the result depends only on the stays passed in.
pub fn annotate_stays(
    stays: &[StaySegment],
    precision: u32,
    offset: UtcOffset,
) -> Result<Vec<(StayId, ActivityAnnotation)>> {
    let frequencies = visit_frequencies(stays, precision);
    let reference_time = stays.iter().map(|s| s.end_time).max().unwrap_or(0);

    stays
        .iter()
        .map(|stay| {
            let frequency = frequencies
                .get(&location_key(stay, precision))
                .copied()
                .unwrap_or(1);
            let (activity_type, confidence) = infer_activity(stay, frequency, offset)?;
            Ok((
                stay.id,
                ActivityAnnotation {
                    activity_type,
                    confidence,
                    frequency,
                    importance: importance(stay, frequency, reference_time),
                    label: label(stay, activity_type),
                },
            ))
        })
        .collect()
}
