// Esquema Diesel (SQLite) de las tablas de workflows.
// Tablas: workflow_definitions, workflow_instances
diesel::table! {
    workflow_definitions (id) {
        id -> Text,
        name -> Text,
        description -> Nullable<Text>,
        active -> Bool,
        owner_id -> Text,
        steps -> Text,
        created_at -> Text,
        updated_at -> Text,
    }
}
diesel::table! {
    workflow_instances (id) {
        id -> Text,
        definition_id -> Text,
        status -> Text,
        current_step_index -> BigInt,
        version -> BigInt,
        created_at -> Text,
        document -> Text,
    }
}
diesel::allow_tables_to_appear_in_same_query!(workflow_definitions, workflow_instances);
