use uuid::Uuid;

/// Short, log-friendly form of a uuid (first group only).
pub fn to_short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_short_id() {
        let id = Uuid::parse_str("7f2c6a6e-52be-4f0e-a2e5-36d4f06ddf39").expect("uuid");
        assert_eq!(to_short_id(&id), "7f2c6a6e");
    }
}
