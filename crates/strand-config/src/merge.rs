//! Layer merging over raw TOML trees.

/// Recursively deep-merge `overlay` into `base`.
///
/// - Tables merge recursively per-field.
/// - Scalars and arrays from the overlay **replace** the base value.
pub fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                if let Some(base_val) = base_table.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}

/// Set the value at a dotted path, creating intermediate tables.
///
/// Does nothing if a non-table value sits on the way.
pub fn set_path(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return;
    };

    let mut current = root;
    for segment in segments {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        current = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
    if let Some(table) = current.as_table_mut() {
        table.insert(leaf.to_owned(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> toml::Value {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn test_deep_merge_keeps_untouched_fields() {
        let mut base = parse("[bus]\nliveness_interval_secs = 300\nblob_idle_timeout_secs = 60");
        deep_merge(&mut base, &parse("[bus]\nliveness_interval_secs = 5"));
        assert_eq!(base["bus"]["liveness_interval_secs"].as_integer(), Some(5));
        assert_eq!(base["bus"]["blob_idle_timeout_secs"].as_integer(), Some(60));
    }

    #[test]
    fn test_deep_merge_replaces_arrays() {
        let mut base = parse("[logging]\ndirectives = [\"a=debug\", \"b=info\"]");
        deep_merge(&mut base, &parse("[logging]\ndirectives = [\"c=trace\"]"));
        assert_eq!(base["logging"]["directives"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_set_path_creates_tables() {
        let mut root = toml::Value::Table(toml::map::Map::new());
        set_path(&mut root, "state.persist_on_commit", toml::Value::Boolean(false));
        assert_eq!(root["state"]["persist_on_commit"].as_bool(), Some(false));
    }

    #[test]
    fn test_set_path_stops_at_scalar() {
        let mut root = parse("state = 1");
        set_path(&mut root, "state.persist_on_commit", toml::Value::Boolean(false));
        assert_eq!(root["state"].as_integer(), Some(1));
    }
}
