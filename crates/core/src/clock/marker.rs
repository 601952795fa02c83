/// A timeline marker whose name carries a live parameter change, written
/// as `key=value` (case-insensitive).
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerCommand {
    /// `swing=<fraction>`
    Swing(f64),
    /// `offset=<milliseconds>`
    OffsetMs(i32),
    /// Matches the `key=value` shape but names no known parameter, or the
    /// value does not parse.
    Unrecognized { key: String, value: String },
}

impl MarkerCommand {
    /// Returns `None` for plain timing markers.
    pub fn parse(name: &str) -> Option<Self> {
        let lowered = name.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split('=')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .collect();
        let [key, value] = tokens.as_slice() else {
            return None;
        };

        let command = match *key {
            "swing" => value.parse::<f64>().ok().map(Self::Swing),
            "offset" => value.parse::<i32>().ok().map(Self::OffsetMs),
            _ => None,
        };

        Some(command.unwrap_or_else(|| Self::Unrecognized {
            key: key.to_string(),
            value: value.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys_case_insensitively() {
        assert_eq!(MarkerCommand::parse("Swing = 0.66"), Some(MarkerCommand::Swing(0.66)));
        assert_eq!(MarkerCommand::parse("OFFSET=-15"), Some(MarkerCommand::OffsetMs(-15)));
    }

    #[test]
    fn plain_names_are_not_commands() {
        assert_eq!(MarkerCommand::parse("chorus"), None);
        assert_eq!(MarkerCommand::parse("a=b=c"), None);
        assert_eq!(MarkerCommand::parse("swing="), None);
    }

    #[test]
    fn bad_values_are_unrecognized() {
        assert_eq!(
            MarkerCommand::parse("swing=lots"),
            Some(MarkerCommand::Unrecognized {
                key: "swing".into(),
                value: "lots".into()
            })
        );
    }
}
