//! Grouping key extraction from push URLs.

use pushgate_store::{is_valid_label_name, GroupingKey, JOB_LABEL};

/// Build the grouping key addressed by `/metrics/job/{job}[/{*labels}]`.
///
/// `labels` is a `/`-separated list of `name/value` pairs. Values may be
/// empty; names must be valid label names and may not repeat.
pub fn grouping_key_from_path(job: &str, labels: Option<&str>) -> Result<GroupingKey, String> {
    if job.is_empty() {
        return Err("job name is required".to_string());
    }
    let mut key = GroupingKey::for_job(job);

    let Some(labels) = labels.filter(|l| !l.is_empty()) else {
        return Ok(key);
    };

    let components: Vec<&str> = labels.split('/').collect();
    if components.len() % 2 != 0 {
        return Err(format!(
            "odd number of components in label string {labels:?}"
        ));
    }

    for pair in components.chunks(2) {
        let (name, value) = (pair[0], pair[1]);
        if !is_valid_label_name(name) {
            return Err(format!("improper label name {name:?}"));
        }
        if name == JOB_LABEL {
            return Err("job label must not be repeated in the label path".to_string());
        }
        if key.insert(name, value).is_some() {
            return Err(format!("duplicate label name {name:?}"));
        }
    }

    Ok(key)
}
