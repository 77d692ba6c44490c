//! Bulk account import. Operators paste newline-separated records together
//! with a format template such as
//! `username:password:email:emailPassword:authToken:twoFactorSecret`.
//! Field names become capture groups, `ANY` ignores a column, and every
//! other character of the template is matched literally.

use crate::store::AccountCredential;
use anyhow::{bail, Result};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Username,
    Password,
    Email,
    EmailPassword,
    AuthToken,
    TwoFactorSecret,
}

impl FieldKind {
    fn token(self) -> &'static str {
        match self {
            FieldKind::Username => "username",
            FieldKind::Password => "password",
            FieldKind::Email => "email",
            FieldKind::EmailPassword => "emailPassword",
            FieldKind::AuthToken => "authToken",
            FieldKind::TwoFactorSecret => "twoFactorSecret",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FormatToken {
    Field(FieldKind),
    Wildcard,
    Literal(String),
}

// Longest names first so `emailPassword` wins over `email`.
const FIELD_ORDER: [FieldKind; 6] = [
    FieldKind::TwoFactorSecret,
    FieldKind::EmailPassword,
    FieldKind::AuthToken,
    FieldKind::Username,
    FieldKind::Password,
    FieldKind::Email,
];

pub struct ImportFormat {
    tokens: Vec<FormatToken>,
    regex: Regex,
}

impl ImportFormat {
    pub fn parse(format: &str) -> Result<Self> {
        let tokens = tokenize(format)?;
        if !tokens.iter().any(|t| matches!(t, FormatToken::Field(FieldKind::Username))) {
            bail!("import format must contain a username field");
        }
        let mut pattern = String::from("^");
        for token in &tokens {
            match token {
                FormatToken::Field(kind) => {
                    pattern.push_str(&format!("(?P<{}>.*?)", kind.token()));
                }
                FormatToken::Wildcard => pattern.push_str(".*?"),
                FormatToken::Literal(lit) => pattern.push_str(&regex::escape(lit)),
            }
        }
        pattern.push('$');
        let regex = Regex::new(&pattern)?;
        Ok(Self { tokens, regex })
    }

    pub fn parse_line(&self, line: &str) -> Option<AccountCredential> {
        let caps = self.regex.captures(line.trim())?;
        let field = |kind: FieldKind| {
            caps.name(kind.token())
                .map(|m| m.as_str().to_string())
                .filter(|v| !v.is_empty())
        };
        let username = field(FieldKind::Username)?;
        let password = field(FieldKind::Password).unwrap_or_default();
        Some(AccountCredential {
            username,
            password,
            email: field(FieldKind::Email).unwrap_or_default(),
            email_password: field(FieldKind::EmailPassword).unwrap_or_default(),
            auth_token: field(FieldKind::AuthToken),
            two_factor_secret: field(FieldKind::TwoFactorSecret),
        })
    }

    /// Parses every non-blank line; returns the records plus how many lines
    /// did not match the format.
    pub fn parse_many(&self, text: &str) -> (Vec<AccountCredential>, usize) {
        let mut records = Vec::new();
        let mut skipped = 0;
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match self.parse_line(line) {
                Some(record) => records.push(record),
                None => skipped += 1,
            }
        }
        (records, skipped)
    }

    /// Inverse of `parse_line` for fields the format names; wildcard columns
    /// render empty.
    pub fn render_line(&self, credential: &AccountCredential) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                FormatToken::Field(FieldKind::Username) => out.push_str(&credential.username),
                FormatToken::Field(FieldKind::Password) => out.push_str(&credential.password),
                FormatToken::Field(FieldKind::Email) => out.push_str(&credential.email),
                FormatToken::Field(FieldKind::EmailPassword) => {
                    out.push_str(&credential.email_password)
                }
                FormatToken::Field(FieldKind::AuthToken) => {
                    out.push_str(credential.auth_token.as_deref().unwrap_or(""))
                }
                FormatToken::Field(FieldKind::TwoFactorSecret) => {
                    out.push_str(credential.two_factor_secret.as_deref().unwrap_or(""))
                }
                FormatToken::Wildcard => {}
                FormatToken::Literal(lit) => out.push_str(lit),
            }
        }
        out
    }
}

fn tokenize(format: &str) -> Result<Vec<FormatToken>> {
    let mut tokens: Vec<FormatToken> = Vec::new();
    let mut rest = format;
    'outer: while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix("ANY") {
            tokens.push(FormatToken::Wildcard);
            rest = stripped;
            continue;
        }
        for kind in FIELD_ORDER {
            if let Some(stripped) = rest.strip_prefix(kind.token()) {
                if tokens.iter().any(|t| t == &FormatToken::Field(kind)) {
                    bail!("duplicate field {:?} in import format", kind.token());
                }
                tokens.push(FormatToken::Field(kind));
                rest = stripped;
                continue 'outer;
            }
        }
        let ch = rest.chars().next().expect("non-empty rest");
        match tokens.last_mut() {
            Some(FormatToken::Literal(lit)) => lit.push(ch),
            _ => tokens.push(FormatToken::Literal(ch.to_string())),
        }
        rest = &rest[ch.len_utf8()..];
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "username:password:email:emailPassword:authToken:twoFactorSecret";

    #[test]
    fn parses_full_format() {
        let format = ImportFormat::parse(FULL).unwrap();
        let record = format
            .parse_line("alice:pw:a@x:ep:tok:JBSWY3DP")
            .unwrap();
        assert_eq!(record.username, "alice");
        assert_eq!(record.password, "pw");
        assert_eq!(record.email, "a@x");
        assert_eq!(record.email_password, "ep");
        assert_eq!(record.auth_token.as_deref(), Some("tok"));
        assert_eq!(record.two_factor_secret.as_deref(), Some("JBSWY3DP"));
    }

    #[test]
    fn any_wildcard_ignores_column() {
        let format =
            ImportFormat::parse("username:password:email:emailPassword:authToken:ANY").unwrap();
        let record = format.parse_line("alice:pw:a@x:ep:tok:garbage").unwrap();
        assert_eq!(record.username, "alice");
        assert_eq!(record.auth_token.as_deref(), Some("tok"));
        assert_eq!(record.two_factor_secret, None);
    }

    #[test]
    fn empty_optional_fields_are_absent() {
        let format = ImportFormat::parse(FULL).unwrap();
        let record = format.parse_line("alice:pw:a@x:ep::").unwrap();
        assert_eq!(record.auth_token, None);
        assert_eq!(record.two_factor_secret, None);
    }

    #[test]
    fn round_trip_identity_without_separator_chars() {
        let format = ImportFormat::parse(FULL).unwrap();
        let record = AccountCredential {
            username: "bob".into(),
            password: "hunter2".into(),
            email: "b@x".into(),
            email_password: "mailpw".into(),
            auth_token: Some("deadbeef".into()),
            two_factor_secret: Some("JBSWY3DPEHPK3PXP".into()),
        };
        let line = format.render_line(&record);
        assert_eq!(format.parse_line(&line).unwrap(), record);
    }

    #[test]
    fn mismatched_lines_are_counted() {
        let format = ImportFormat::parse("username;password").unwrap();
        let (records, skipped) = format.parse_many("alice;pw\nbroken-line\n\nbob;pw2\n");
        assert_eq!(records.len(), 2);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn format_without_username_is_rejected() {
        assert!(ImportFormat::parse("password:email").is_err());
    }

    #[test]
    fn double_import_same_username_keeps_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::store::AccountStore::open(dir.path().join("a.json")).unwrap();
        let format = ImportFormat::parse("username:password").unwrap();
        let (records, _) = format.parse_many("alice:pw\nalice:pw\n");
        assert_eq!(store.add(records).unwrap(), 1);
    }
}
