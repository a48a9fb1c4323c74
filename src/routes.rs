use crate::{
    conversation::ConversationSummary,
    message::{
        message_dto::SendMessageRequest,
        message_handlers,
        message_models::{Message, MessageWithSender},
    },
    middleware::auth_middleware,
    state::AppState,
    user::PublicProfile,
    websocket::types::{
        CreateConversationReplyPayload, ErrorPayload, ReceiveMessagePayload, WsMessage,
    },
};
use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};
use axum::http::{header::{AUTHORIZATION, CONTENT_TYPE}, HeaderValue, Method};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::message::message_handlers::send_message,
        crate::message::message_handlers::get_conversations,
        crate::message::message_handlers::get_conversation_messages,
        crate::message::message_handlers::mark_message_read,
    ),
    components(
        schemas(
            SendMessageRequest,
            Message,
            MessageWithSender,
            ConversationSummary,
            PublicProfile,
            WsMessage,
            ReceiveMessagePayload,
            CreateConversationReplyPayload,
            ErrorPayload,
        )
    ),
    tags(
        (name = "messages", description = "Conversation messaging endpoints")
    ),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::Http::new(
                        utoipa::openapi::security::HttpAuthScheme::Bearer,
                    ),
                ),
            )
        }
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    // Authenticated message routes
    let protected_message_routes = Router::new()
        .route("/send", post(message_handlers::send_message))
        .route("/get-conversations", get(message_handlers::get_conversations))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let message_routes = Router::new()
        .route(
            "/conversation/:conversation_id",
            get(message_handlers::get_conversation_messages),
        )
        .route("/receive/:message_id", patch(message_handlers::mark_message_read))
        .merge(protected_message_routes);

    // WebSocket route
    let ws_routes = Router::new()
        .route("/ws", get(crate::websocket::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let api_routes = Router::new()
        .nest("/messages", message_routes)
        .merge(ws_routes);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
