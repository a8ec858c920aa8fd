//! Client-side signup checks that mirror the backend's rules.

use crate::error::Error;
use crate::types::NewUser;

const SPECIAL_CHARS: &str = "!@#$%^&*(),.?:{}|<>";

/// Returns every password-complexity rule `password` breaks, worded exactly
/// as the backend words them. Empty means the password is acceptable.
#[must_use]
pub fn password_problems(password: &str) -> Vec<&'static str> {
    let mut problems = Vec::new();
    if password.chars().count() < 12 {
        problems.push("Password must be at least 12 characters long");
    }
    if !password.chars().any(char::is_uppercase) {
        problems.push("Password must contain at least one uppercase letter");
    }
    if !password.chars().any(char::is_lowercase) {
        problems.push("Password must contain at least one lowercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        problems.push("Password must contain at least one digit");
    }
    if !password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
        problems.push("Password must contain at least one special character");
    }
    problems
}

/// Validates a password before it is sent anywhere.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] with all broken rules joined by `; `.
pub fn check_password(password: &str) -> Result<(), Error> {
    let problems = password_problems(password);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidInput(problems.join("; ")))
    }
}

/// Validates a signup payload: username length, a plausible email and the
/// password rules.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for the first failing field.
pub fn check_new_user(user: &NewUser) -> Result<(), Error> {
    let username_len = user.username.chars().count();
    if !(3..=50).contains(&username_len) {
        return Err(Error::InvalidInput(
            "username: must be between 3 and 50 characters".into(),
        ));
    }
    if !is_plausible_email(&user.email) {
        return Err(Error::InvalidInput(
            "email: not a valid email address".into(),
        ));
    }
    check_password(&user.password)
}

/// Shape check only; the backend does the real validation.
fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}
