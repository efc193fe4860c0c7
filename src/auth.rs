use crate::db;
use crate::error::ApiError;
use crate::model::User;
use anyhow::Result;
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

pub const TOKEN_LIFETIME: Duration = Duration::hours(24);

const DEFAULT_AVATAR: &str = "👤";

/// Hash a password using argon2id with a per-user random salt.
pub fn hash_password(pass: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(pass.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!(e))?
        .to_string();
    Ok(hash)
}

/// Verify a password against an encoded hash.
pub fn verify_password(pass: &str, hash: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        Argon2::default()
            .verify_password(pass.as_bytes(), &parsed)
            .is_ok()
    } else {
        false
    }
}

/// Claims stored within issued tokens. `sub` is the user id.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

impl Claims {
    pub fn user_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }
}

/// Issue a token for a user valid for the provided duration.
pub fn issue_token(secret: &[u8], user_id: i64, valid_for: Duration) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a token and return its claims if valid.
pub fn verify_token(secret: &[u8], token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(data.claims)
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        avatar: row.get(3)?,
        status: row.get(4)?,
        phone: row.get(5)?,
    })
}

/// Create an account. Username and phone uniqueness is pre-checked for
/// friendly messages, but the UNIQUE constraints are the real guarantee;
/// a constraint violation at insert time maps to the same conflict.
pub fn register(
    conn: &mut Connection,
    username: &str,
    password: &str,
    display_name: Option<&str>,
    avatar: Option<&str>,
    phone: &str,
) -> Result<User, ApiError> {
    let username = username.trim();
    let password = password.trim();
    let phone = phone.trim();
    if username.is_empty() || password.is_empty() {
        return Err(ApiError::validation("Username and password required"));
    }
    if phone.is_empty() {
        return Err(ApiError::validation("Phone number required"));
    }
    let display_name = display_name
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(username);
    let avatar = avatar
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_AVATAR);

    let hash = hash_password(password)?;
    let tx = conn.transaction()?;
    let taken: Option<i64> = tx
        .query_row("SELECT id FROM users WHERE username = ?1", [username], |r| {
            r.get(0)
        })
        .optional()?;
    if taken.is_some() {
        return Err(ApiError::conflict("Username already exists"));
    }
    let taken: Option<i64> = tx
        .query_row("SELECT id FROM users WHERE phone = ?1", [phone], |r| {
            r.get(0)
        })
        .optional()?;
    if taken.is_some() {
        return Err(ApiError::conflict("Phone number already registered"));
    }
    if let Err(e) = tx.execute(
        "INSERT INTO users (username, password_hash, display_name, avatar, phone) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![username, hash, display_name, avatar, phone],
    ) {
        if db::is_constraint_violation(&e) {
            // lost the race after the pre-checks passed
            let msg = if e.to_string().contains("users.phone") {
                "Phone number already registered"
            } else {
                "Username already exists"
            };
            return Err(ApiError::conflict(msg));
        }
        return Err(e.into());
    }
    let id = tx.last_insert_rowid();
    tx.commit()?;
    Ok(User {
        id,
        username: username.into(),
        display_name: display_name.into(),
        avatar: avatar.into(),
        status: None,
        phone: phone.into(),
    })
}

/// Authenticate a user. Unknown usernames and wrong passwords produce
/// the same error so the response leaks nothing about which it was.
pub fn login(conn: &Connection, username: &str, password: &str) -> Result<User, ApiError> {
    let username = username.trim();
    let password = password.trim();
    if username.is_empty() || password.is_empty() {
        return Err(ApiError::validation("Username and password required"));
    }
    let row = conn
        .query_row(
            "SELECT id, username, display_name, avatar, status, phone, password_hash \
             FROM users WHERE username = ?1",
            [username],
            |row| Ok((row_to_user(row)?, row.get::<_, String>(6)?)),
        )
        .optional()?;
    let Some((user, hash)) = row else {
        return Err(ApiError::auth("Invalid credentials"));
    };
    if !verify_password(password, &hash) {
        return Err(ApiError::auth("Invalid credentials"));
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn hash_and_verify() {
        let hash = hash_password("secret").unwrap();
        assert!(verify_password("secret", &hash));
        assert!(!verify_password("bad", &hash));
    }

    #[test]
    fn token_issue_and_verify() {
        let secret = b"secret";
        let token = issue_token(secret, 42, Duration::seconds(60)).unwrap();
        let claims = verify_token(secret, &token).unwrap();
        assert_eq!(claims.user_id(), Some(42));
    }

    #[test]
    fn token_expiry() {
        let secret = b"secret";
        let token = issue_token(secret, 42, Duration::seconds(-120)).unwrap();
        assert!(verify_token(secret, &token).is_err());
    }

    #[test]
    fn token_wrong_secret() {
        let token = issue_token(b"secret", 42, Duration::seconds(60)).unwrap();
        assert!(verify_token(b"other", &token).is_err());
    }

    #[test]
    fn register_validates_fields() {
        let mut conn = db::init_db(":memory:").unwrap();
        assert!(matches!(
            register(&mut conn, "", "x", None, None, "+1"),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            register(&mut conn, "ann", "", None, None, "+1"),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            register(&mut conn, "ann", "x", None, None, "  "),
            Err(ApiError::Validation(_))
        ));
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn register_defaults_and_conflicts() {
        let mut conn = db::init_db(":memory:").unwrap();
        let ann = register(&mut conn, "ann", "x", None, None, "+1").unwrap();
        assert_eq!(ann.display_name, "ann");
        assert_eq!(ann.avatar, "👤");

        let err = register(&mut conn, "ann", "y", None, None, "+2").unwrap_err();
        assert!(matches!(err, ApiError::Conflict(m) if m == "Username already exists"));
        let err = register(&mut conn, "bob", "y", None, None, "+1").unwrap_err();
        assert!(matches!(err, ApiError::Conflict(m) if m == "Phone number already registered"));

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn login_roundtrip() {
        let mut conn = db::init_db(":memory:").unwrap();
        let ann = register(&mut conn, "ann", "pass", Some("Ann"), Some("🎨"), "+1").unwrap();

        let user = login(&conn, "ann", "pass").unwrap();
        assert_eq!(user.id, ann.id);
        assert_eq!(user.display_name, "Ann");
        assert_eq!(user.avatar, "🎨");

        assert!(matches!(
            login(&conn, "ann", "wrong"),
            Err(ApiError::Auth(_))
        ));
        // unknown username reads the same as a wrong password
        let known = login(&conn, "ann", "wrong").unwrap_err().to_string();
        let unknown = login(&conn, "nobody", "pass").unwrap_err().to_string();
        assert_eq!(known, unknown);
    }
}
