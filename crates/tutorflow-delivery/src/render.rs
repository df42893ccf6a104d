//! Message rendering and click-bucket thresholds

use tutorflow_model::Assignment;

/// Click-count display buckets; the broadcast post is edited only when the
/// displayed bucket changes, not on every click.
const CLICK_BUCKETS: [i64; 6] = [0, 5, 10, 25, 50, 100];

/// Bucket floor for a click count.
#[must_use]
pub fn click_bucket(count: i64) -> i64 {
    CLICK_BUCKETS
        .iter()
        .rev()
        .find(|&&floor| count >= floor)
        .copied()
        .unwrap_or(0)
}

/// Render the DM body for one assignment.
#[must_use]
pub fn render_dm(a: &Assignment, distance_km: Option<f64>) -> String {
    let mut out = String::new();
    if let Some(text) = &a.academic_display_text {
        out.push_str(text);
        out.push('\n');
    }
    if let Some(rate) = &a.rate_raw_text {
        out.push_str(&format!("Rate: {rate}\n"));
    }
    if !a.address.is_empty() {
        out.push_str(&format!("Location: {}\n", a.address.join(", ")));
    }
    if let Some(mrt) = &a.nearest_mrt_computed {
        out.push_str(&format!("Nearest MRT: {mrt}\n"));
    }
    if let Some(km) = distance_km {
        out.push_str(&format!("~{km:.1} km from you\n"));
    }
    if !a.lesson_schedule.is_empty() {
        out.push_str(&format!("Schedule: {}\n", a.lesson_schedule.join("; ")));
    }
    if let Some(link) = &a.message_link {
        out.push_str(link);
    }
    out.trim_end().to_string()
}

/// Render the broadcast body; `duplicate_note` carries the "posted by N
/// agencies" line in `primary_with_note` mode, `clicks` the display count.
#[must_use]
pub fn render_broadcast(a: &Assignment, clicks: i64, duplicate_note: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(text) = &a.academic_display_text {
        out.push_str(text);
        out.push('\n');
    }
    if let Some(rate) = &a.rate_raw_text {
        out.push_str(&format!("Rate: {rate}\n"));
    }
    if !a.address.is_empty() {
        out.push_str(&format!("Location: {}\n", a.address.join(", ")));
    }
    if let Some(note) = duplicate_note {
        out.push_str(note);
        out.push('\n');
    }
    let bucket = click_bucket(clicks);
    if bucket > 0 {
        out.push_str(&format!("🔥 {bucket}+ tutors interested\n"));
    }
    if let Some(link) = &a.message_link {
        out.push_str(link);
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_click_buckets() {
        assert_eq!(click_bucket(0), 0);
        assert_eq!(click_bucket(4), 0);
        assert_eq!(click_bucket(5), 5);
        assert_eq!(click_bucket(9), 5);
        assert_eq!(click_bucket(27), 25);
        assert_eq!(click_bucket(250), 100);
    }

    #[test]
    fn test_bucket_transition_points() {
        // The editor loop only reposts when these differ
        assert_eq!(click_bucket(4), click_bucket(3));
        assert_ne!(click_bucket(5), click_bucket(4));
        assert_ne!(click_bucket(10), click_bucket(9));
    }
}
