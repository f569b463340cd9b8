//! Edge Case Tests for Authentication
//!
//! Boundary conditions in:
//! - JWT expiry and tampering
//! - Password policy limits
//! - Login identifier classification

#[cfg(test)]
mod jwt_tests {
    use super::super::jwt::*;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    const SECRET: &str = "edge-case-jwt-secret-with-enough-length";

    fn token_with_exp(exp: OffsetDateTime) -> String {
        let claims = Claims {
            sub: Uuid::new_v4(),
            email: "ada@example.com".to_string(),
            role: "member".to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: (exp - Duration::hours(24)).unix_timestamp(),
            exp: exp.unix_timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    // =========================================================================
    // Token expiring in the future is accepted
    // =========================================================================
    #[test]
    fn test_token_valid_until_expiry() {
        let manager = JwtManager::new(SECRET, 24);
        let token = token_with_exp(OffsetDateTime::now_utc() + Duration::minutes(5));
        assert!(manager.validate_access_token(&token).is_ok());
    }

    // =========================================================================
    // Token expired well beyond the validation leeway is rejected
    // =========================================================================
    #[test]
    fn test_token_rejected_after_leeway() {
        let manager = JwtManager::new(SECRET, 24);
        let token = token_with_exp(OffsetDateTime::now_utc() - Duration::minutes(5));
        assert!(manager.validate_access_token(&token).is_err());
    }

    // =========================================================================
    // Tampered payload fails signature verification
    // =========================================================================
    #[test]
    fn test_tampered_payload_rejected() {
        let manager = JwtManager::new(SECRET, 24);
        let issued = manager
            .generate_access_token(Uuid::new_v4(), "ada@example.com", "member")
            .unwrap();

        let mut parts: Vec<String> = issued.token.split('.').map(String::from).collect();
        let forged = JwtManager::new(SECRET, 24)
            .generate_access_token(Uuid::new_v4(), "ada@example.com", "admin")
            .unwrap();
        parts[1] = forged.token.split('.').nth(1).unwrap().to_string();

        assert!(manager.validate_access_token(&parts.join(".")).is_err());
    }

    // =========================================================================
    // Each issued token gets its own session key
    // =========================================================================
    #[test]
    fn test_each_token_has_unique_jti() {
        let manager = JwtManager::new(SECRET, 1);
        let identity_id = Uuid::new_v4();
        let a = manager
            .generate_access_token(identity_id, "ada@example.com", "member")
            .unwrap();
        let b = manager
            .generate_access_token(identity_id, "ada@example.com", "member")
            .unwrap();
        assert_ne!(a.jti, b.jti);
        assert!(b.expires_at <= OffsetDateTime::now_utc() + Duration::hours(1));
    }
}

#[cfg(test)]
mod password_tests {
    use super::super::password::*;

    // =========================================================================
    // Exactly eight characters is the minimum accepted length
    // =========================================================================
    #[test]
    fn test_minimum_length_boundary() {
        assert!(validate_password_strength("abcdef12").is_ok());
        assert!(validate_password_strength("abcde12").is_err());
    }

    // =========================================================================
    // Length counts characters, not bytes
    // =========================================================================
    #[test]
    fn test_length_counts_characters() {
        // 7 characters, 9 bytes
        assert!(validate_password_strength("ọlá1234").is_err());
        assert!(validate_password_strength("ọlá12345").is_ok());
    }

    // =========================================================================
    // Upper bound on length
    // =========================================================================
    #[test]
    fn test_maximum_length_boundary() {
        let at_limit = format!("a1{}", "x".repeat(126));
        let over_limit = format!("a1{}", "x".repeat(127));
        assert!(validate_password_strength(&at_limit).is_ok());
        assert!(validate_password_strength(&over_limit).is_err());
    }
}

#[cfg(test)]
mod identifier_tests {
    use nitp_shared::Identifier;

    // =========================================================================
    // Membership IDs are recognised regardless of case and whitespace
    // =========================================================================
    #[test]
    fn test_membership_id_login() {
        let parsed = Identifier::parse("  tp-a00012345 ");
        assert_eq!(parsed.kind(), "membership_id");
        assert_eq!(parsed.value(), "TP-A00012345");
    }

    // =========================================================================
    // A near-miss membership ID falls back to a username lookup
    // =========================================================================
    #[test]
    fn test_short_membership_id_is_username() {
        assert_eq!(Identifier::parse("TP-A1234").kind(), "username");
    }
}
