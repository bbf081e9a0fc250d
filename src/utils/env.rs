// SPDX-License-Identifier: GPL-3.0-only

pub fn parse_bool(value: &str) -> bool {
    ["1", "true", "yes", "y"].contains(&value.trim().to_lowercase().as_str())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn truthy_values() {
        for value in ["1", "true", "TRUE", "yes", "Y", " y "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "no", "", "on"] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
