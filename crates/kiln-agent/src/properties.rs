//! `key=value` properties files that keep comments, blank lines and key order intact.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// Comment, blank line, or anything that is not a key/value pair.
    Verbatim(String),
    Entry { key: String, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    lines: Vec<Line>,
}

impl Properties {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|raw| {
                let trimmed = raw.trim_start();
                if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
                    return Line::Verbatim(raw.to_string());
                }
                match raw.split_once('=') {
                    Some((k, v)) => Line::Entry {
                        key: k.trim().to_string(),
                        value: v.trim_start().to_string(),
                    },
                    None => Line::Verbatim(raw.to_string()),
                }
            })
            .collect();
        Self { lines }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|l| match l {
            Line::Entry { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Updates the key in place, or appends it when absent.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        for line in self.lines.iter_mut() {
            if let Line::Entry { key: k, value: v } = line
                && k == key
            {
                *v = value;
                return;
            }
        }
        self.lines.push(Line::Entry {
            key: key.to_string(),
            value,
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|l| match l {
            Line::Entry { key, value } => Some((key.as_str(), value.as_str())),
            Line::Verbatim(_) => None,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Verbatim(raw) => out.push_str(raw),
                Line::Entry { key, value } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                }
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "#Minecraft server properties\n#Sat Jan 01 00:00:00 UTC 2026\nmotd=A Minecraft Server\nmax-players=20\n\nserver-port=25565\n";

    #[test]
    fn roundtrip_preserves_comments_and_order() {
        let props = Properties::parse(SAMPLE);
        assert_eq!(props.render(), SAMPLE);
    }

    #[test]
    fn set_updates_in_place() {
        let mut props = Properties::parse(SAMPLE);
        props.set("max-players", "40");
        let out = props.render();
        assert!(out.starts_with("#Minecraft server properties\n"));
        assert!(out.contains("motd=A Minecraft Server\nmax-players=40\n"));
        assert_eq!(props.get("max-players"), Some("40"));
    }

    #[test]
    fn set_appends_new_keys() {
        let mut props = Properties::parse(SAMPLE);
        props.set("online-mode", "false");
        assert!(props.render().ends_with("server-port=25565\nonline-mode=false\n"));
    }

    #[test]
    fn values_may_contain_equals() {
        let props = Properties::parse("motd=a=b\n");
        assert_eq!(props.get("motd"), Some("a=b"));
    }

    #[test]
    fn entries_skip_comments() {
        let props = Properties::parse(SAMPLE);
        let keys: Vec<&str> = props.entries().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["motd", "max-players", "server-port"]);
    }
}
