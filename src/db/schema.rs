diesel::table! {
    users (uuid) {
        uuid -> Text,
        email -> Text,
        first_name -> Nullable<Text>,
        last_name -> Nullable<Text>,
        is_admin -> Bool,
        organization -> Nullable<Text>,
        last_login_web_at -> Nullable<Timestamp>,
        last_login_app_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
        deleted_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    identities (uuid) {
        uuid -> Text,
        user_uuid -> Text,
        provider -> Text,
        provider_subject -> Text,
        email -> Nullable<Text>,
        attributes -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    devices (uuid) {
        uuid -> Text,
        user_uuid -> Text,
        atype -> Integer,
        platform -> Nullable<Text>,
        app_version -> Nullable<Text>,
        os_version -> Nullable<Text>,
        is_active -> Bool,
        last_active_at -> Timestamp,
        revoked_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    sessions (uuid) {
        uuid -> Text,
        user_uuid -> Text,
        device_uuid -> Nullable<Text>,
        refresh_token_hash -> Text,
        refresh_token_family -> Text,
        auth_method -> Text,
        remote_ip -> Nullable<Text>,
        user_agent -> Nullable<Text>,
        expires_at -> Timestamp,
        last_used_at -> Timestamp,
        created_at -> Timestamp,
        revoked_at -> Nullable<Timestamp>,
        revoke_reason -> Nullable<Text>,
    }
}

diesel::table! {
    auth_codes (uuid) {
        uuid -> Text,
        user_uuid -> Text,
        client_id -> Text,
        redirect_uri -> Text,
        code_challenge -> Text,
        challenge_method -> Text,
        scopes -> Nullable<Text>,
        auth_method -> Text,
        device_uuid -> Nullable<Text>,
        device_platform -> Nullable<Text>,
        expires_at -> Timestamp,
        used_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    handoff_codes (code) {
        code -> Text,
        poll_token -> Text,
        user_uuid -> Text,
        device_uuid -> Text,
        external_session_id -> Nullable<Text>,
        expires_at -> Timestamp,
        used -> Bool,
        used_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    auth_connections (uuid) {
        uuid -> Text,
        broker_connection_id -> Text,
        protocol -> Text,
        enabled -> Bool,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    sso_domains (domain) {
        domain -> Text,
        connection_uuid -> Text,
        email_pattern -> Nullable<Text>,
        enabled -> Bool,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::joinable!(identities -> users (user_uuid));
diesel::joinable!(devices -> users (user_uuid));
diesel::joinable!(sessions -> users (user_uuid));
diesel::joinable!(sessions -> devices (device_uuid));
diesel::joinable!(auth_codes -> users (user_uuid));
diesel::joinable!(handoff_codes -> users (user_uuid));
diesel::joinable!(handoff_codes -> devices (device_uuid));
diesel::joinable!(sso_domains -> auth_connections (connection_uuid));

diesel::allow_tables_to_appear_in_same_query!(
    users,
    identities,
    devices,
    sessions,
    auth_codes,
    handoff_codes,
    auth_connections,
    sso_domains,
);
