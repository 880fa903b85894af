use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::info;
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::models::User;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

pub fn create_jwt(user_id: &str, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let expiration = Utc::now() + Duration::hours(24);
    let claims = Claims {
        sub: user_id.to_string(),
        exp: expiration.timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )
}

pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

/// Pulls the authenticated user id the middleware stored in extensions.
pub fn current_user(req: &HttpRequest) -> Result<String, ApiError> {
    req.extensions()
        .get::<String>()
        .cloned()
        .ok_or(ApiError::Unauthenticated)
}

#[derive(Deserialize)]
pub struct SignupInfo {
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginInfo {
    pub email: String,
    pub password: String,
}

// POST /auth/signup
pub async fn signup(
    data: web::Data<AppState>,
    info: web::Json<SignupInfo>,
) -> Result<HttpResponse, ApiError> {
    let email = info.email.trim().to_lowercase();
    if email.is_empty() || info.password.is_empty() {
        return Err(ApiError::InvalidInput(
            "Email and password are required".to_string(),
        ));
    }

    let users = data.mongodb.db.collection::<User>("users");
    if users.find_one(doc! { "email": &email }).await?.is_some() {
        return Err(ApiError::InvalidInput(
            "Email address already registered".to_string(),
        ));
    }

    let password_hash = hash(&info.password, DEFAULT_COST)
        .map_err(|_| ApiError::InvalidInput("Could not hash password".to_string()))?;

    let new_user = User {
        id: None,
        user_id: Uuid::new_v4().to_string(),
        firstname: info.firstname.trim().to_string(),
        lastname: info.lastname.trim().to_string(),
        email,
        password_hash,
        groups: Vec::new(),
        invites: Vec::new(),
    };
    users.insert_one(&new_user).await?;

    info!("User registered: {}", new_user.user_id);
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "User created",
        "user_id": new_user.user_id,
    })))
}

// POST /auth/login
pub async fn login(
    data: web::Data<AppState>,
    info: web::Json<LoginInfo>,
) -> Result<HttpResponse, ApiError> {
    let users = data.mongodb.db.collection::<User>("users");
    let email = info.email.trim().to_lowercase();

    let user = users
        .find_one(doc! { "email": &email })
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid credentials".to_string()))?;

    if !verify(&info.password, &user.password_hash).unwrap_or(false) {
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    }

    let token = create_jwt(&user.user_id, &data.config.jwt_secret)
        .map_err(|_| ApiError::Unauthorized("Could not issue token".to_string()))?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "token": token,
        "user_id": user.user_id,
        "name": user.full_name(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_round_trip_recovers_the_subject() {
        let token = create_jwt("user-42", "test-secret").unwrap();
        let claims = validate_jwt(&token, "test-secret").unwrap();
        assert_eq!(claims.sub, "user-42");
    }

    #[test]
    fn jwt_rejects_the_wrong_secret() {
        let token = create_jwt("user-42", "test-secret").unwrap();
        assert!(validate_jwt(&token, "other-secret").is_err());
    }
}
