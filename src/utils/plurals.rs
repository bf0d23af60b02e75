/// `3 traces`, `1 trace`, `2 directories`.
pub fn counted(count: usize, singular: &str, plural: Option<&str>) -> String {
    let noun = match (count, plural) {
        (1, _) => singular.to_string(),
        (_, Some(plural)) => plural.to_string(),
        (_, None) => format!("{singular}s"),
    };
    format!("{count} {noun}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noun_agrees_with_count() {
        assert_eq!(counted(1, "trace", None), "1 trace");
        assert_eq!(counted(0, "trace", None), "0 traces");
        assert_eq!(counted(2, "directory", Some("directories")), "2 directories");
    }
}
