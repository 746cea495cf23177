//! Postgres-backed `TokenStore` (feature `postgres`). Mirrors
//! `PostgresProcessStore`-style stores: `sqlx::PgPool`, embedded migrations,
//! JSONB columns for nested structures, `INSERT ... ON CONFLICT DO UPDATE`
//! for upserts, and a `RETURNING`-based atomic increment for gateway joins.

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::events::CoreEvent;
use crate::incident::Incident;
use crate::model::{
    BufferedMessage, ErrorBoundarySubscription, GatewaySyncState, InstanceState,
    MessageSubscription, ProcessInstance, SignalSubscription, TimerRecord, Token, TokenState,
};
use crate::store::{StoreResult, TokenStore};

fn map_sqlx(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn map_json<T>(e: serde_json::Error) -> StoreError {
    let _ = std::marker::PhantomData::<T>;
    StoreError::Unavailable(format!("json: {e}"))
}

fn to_json<T: serde::Serialize>(v: &T) -> StoreResult<serde_json::Value> {
    serde_json::to_value(v).map_err(map_json::<T>)
}

fn from_json<T: serde::de::DeserializeOwned>(v: serde_json::Value) -> StoreResult<T> {
    serde_json::from_value(v).map_err(map_json::<T>)
}

pub struct PostgresTokenStore {
    pool: sqlx::PgPool,
}

impl PostgresTokenStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    fn row_to_token(row: &sqlx::postgres::PgRow) -> StoreResult<Token> {
        let waiting_for: Option<String> = row.try_get("waiting_for").map_err(map_sqlx)?;
        let state_str: String = row.try_get("state").map_err(map_sqlx)?;
        let variables: serde_json::Value = row.try_get("variables").map_err(map_sqlx)?;
        let child_ids: serde_json::Value = row.try_get("child_token_ids").map_err(map_sqlx)?;
        Ok(Token {
            id: row.try_get("token_id").map_err(map_sqlx)?,
            instance_id: row.try_get("instance_id").map_err(map_sqlx)?,
            definition_key: row.try_get("definition_key").map_err(map_sqlx)?,
            current_element_id: row.try_get("current_element_id").map_err(map_sqlx)?,
            previous_element_id: row.try_get("previous_element_id").map_err(map_sqlx)?,
            state: from_json(serde_json::Value::String(state_str))?,
            waiting_for: waiting_for.map(|s| s.parse().map_err(|_| StoreError::Unavailable("bad waiting_for".into()))).transpose()?,
            variables: crate::vars::Variables::from_json(variables),
            created_at: row.try_get("created_at").map_err(map_sqlx)?,
            updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
            parent_token_id: row.try_get("parent_token_id").map_err(map_sqlx)?,
            child_token_ids: from_json(child_ids)?,
        })
    }
}

#[async_trait]
impl TokenStore for PostgresTokenStore {
    async fn save_token(&self, token: &Token) -> StoreResult<()> {
        let state = to_json(&token.state)?;
        let variables = token.variables.clone().into_json();
        let child_ids = to_json(&token.child_token_ids)?;
        let waiting_for = token.waiting_for.as_ref().map(|w| w.to_string());
        sqlx::query(
            r#"
            INSERT INTO tokens (
                token_id, instance_id, definition_key, current_element_id,
                previous_element_id, state, waiting_for, variables,
                created_at, updated_at, parent_token_id, child_token_ids
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
            ON CONFLICT (token_id) DO UPDATE SET
                current_element_id = EXCLUDED.current_element_id,
                previous_element_id = EXCLUDED.previous_element_id,
                state = EXCLUDED.state,
                waiting_for = EXCLUDED.waiting_for,
                variables = EXCLUDED.variables,
                updated_at = EXCLUDED.updated_at,
                child_token_ids = EXCLUDED.child_token_ids
            "#,
        )
        .bind(token.id)
        .bind(token.instance_id)
        .bind(&token.definition_key)
        .bind(&token.current_element_id)
        .bind(&token.previous_element_id)
        .bind(state.as_str().unwrap_or_default())
        .bind(waiting_for)
        .bind(variables)
        .bind(token.created_at)
        .bind(token.updated_at)
        .bind(token.parent_token_id)
        .bind(child_ids)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_token(&self, token: &Token) -> StoreResult<()> {
        self.save_token(token).await
    }

    async fn load_token(&self, id: Uuid) -> StoreResult<Token> {
        let row = sqlx::query("SELECT * FROM tokens WHERE token_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or(StoreError::NotFound)?;
        Self::row_to_token(&row)
    }

    async fn delete_token(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM tokens WHERE token_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_tokens_by_instance(&self, instance_id: Uuid) -> StoreResult<Vec<Token>> {
        let rows = sqlx::query("SELECT * FROM tokens WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(Self::row_to_token).collect()
    }

    async fn load_tokens_by_state(&self, state: TokenState) -> StoreResult<Vec<Token>> {
        let state_json = to_json(&state)?;
        let rows = sqlx::query("SELECT * FROM tokens WHERE state = $1")
            .bind(state_json.as_str().unwrap_or_default())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(Self::row_to_token).collect()
    }

    async fn load_active_tokens(&self) -> StoreResult<Vec<Token>> {
        self.load_tokens_by_state(TokenState::Active).await
    }

    async fn save_instance(&self, instance: &ProcessInstance) -> StoreResult<()> {
        let state = to_json(&instance.state)?;
        let variables = instance.variables.clone().into_json();
        sqlx::query(
            r#"
            INSERT INTO process_instances (instance_id, definition_key, state, started_at, ended_at, variables)
            VALUES ($1,$2,$3,$4,$5,$6)
            ON CONFLICT (instance_id) DO UPDATE SET
                state = EXCLUDED.state, ended_at = EXCLUDED.ended_at, variables = EXCLUDED.variables
            "#,
        )
        .bind(instance.id)
        .bind(&instance.definition_key)
        .bind(state.as_str().unwrap_or_default())
        .bind(instance.started_at)
        .bind(instance.ended_at)
        .bind(variables)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_instance(&self, instance: &ProcessInstance) -> StoreResult<()> {
        self.save_instance(instance).await
    }

    async fn load_instance(&self, id: Uuid) -> StoreResult<ProcessInstance> {
        let row = sqlx::query("SELECT * FROM process_instances WHERE instance_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or(StoreError::NotFound)?;
        let state_str: String = row.try_get("state").map_err(map_sqlx)?;
        let variables: serde_json::Value = row.try_get("variables").map_err(map_sqlx)?;
        Ok(ProcessInstance {
            id: row.try_get("instance_id").map_err(map_sqlx)?,
            definition_key: row.try_get("definition_key").map_err(map_sqlx)?,
            state: from_json(serde_json::Value::String(state_str))?,
            started_at: row.try_get("started_at").map_err(map_sqlx)?,
            ended_at: row.try_get("ended_at").map_err(map_sqlx)?,
            variables: crate::vars::Variables::from_json(variables),
        })
    }

    async fn update_instance_state(&self, id: Uuid, state: InstanceState) -> StoreResult<()> {
        let state_json = to_json(&state)?;
        let ended_at = matches!(state, InstanceState::Completed | InstanceState::Canceled)
            .then(chrono::Utc::now);
        let result = sqlx::query(
            "UPDATE process_instances SET state = $1, ended_at = COALESCE($2, ended_at) WHERE instance_id = $3",
        )
        .bind(state_json.as_str().unwrap_or_default())
        .bind(ended_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn save_message_subscription(&self, sub: &MessageSubscription) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO message_subscriptions
                (sub_id, definition_key, start_event_id, token_id, message_name, correlation_key, active, created_at, element_id, cancel_activity)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            ON CONFLICT (sub_id) DO UPDATE SET active = EXCLUDED.active
            "#,
        )
        .bind(sub.id)
        .bind(&sub.definition_key)
        .bind(&sub.start_event_id)
        .bind(sub.token_id)
        .bind(&sub.message_name)
        .bind(&sub.correlation_key)
        .bind(sub.active)
        .bind(sub.created_at)
        .bind(&sub.element_id)
        .bind(sub.cancel_activity)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_message_subscription(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM message_subscriptions WHERE sub_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_message_subscriptions(
        &self,
        message_name: &str,
        correlation_key: &str,
        process_start_only: bool,
    ) -> StoreResult<Vec<MessageSubscription>> {
        let rows = sqlx::query(
            "SELECT * FROM message_subscriptions WHERE message_name = $1 AND correlation_key = $2 AND active = TRUE",
        )
        .bind(message_name)
        .bind(correlation_key)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter()
            .map(row_to_message_sub)
            .collect::<StoreResult<Vec<_>>>()
            .map(|subs| {
                subs.into_iter()
                    .filter(|s| !process_start_only || s.is_process_start())
                    .collect()
            })
    }

    async fn load_all_message_subscriptions(&self) -> StoreResult<Vec<MessageSubscription>> {
        let rows = sqlx::query("SELECT * FROM message_subscriptions")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_message_sub).collect()
    }

    async fn save_signal_subscription(&self, sub: &SignalSubscription) -> StoreResult<()> {
        let variables = sub.variables.clone().into_json();
        sqlx::query(
            r#"
            INSERT INTO signal_subscriptions (sub_id, signal_name, token_id, element_id, cancel_activity, variables)
            VALUES ($1,$2,$3,$4,$5,$6)
            ON CONFLICT (sub_id) DO NOTHING
            "#,
        )
        .bind(sub.id)
        .bind(&sub.signal_name)
        .bind(sub.token_id)
        .bind(&sub.element_id)
        .bind(sub.cancel_activity)
        .bind(variables)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_signal_subscription(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM signal_subscriptions WHERE sub_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_signal_subscriptions(&self, signal_name: &str) -> StoreResult<Vec<SignalSubscription>> {
        let rows = sqlx::query("SELECT * FROM signal_subscriptions WHERE signal_name = $1")
            .bind(signal_name)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_signal_sub).collect()
    }

    async fn load_all_signal_subscriptions(&self) -> StoreResult<Vec<SignalSubscription>> {
        let rows = sqlx::query("SELECT * FROM signal_subscriptions")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_signal_sub).collect()
    }

    async fn save_error_boundary(&self, sub: &ErrorBoundarySubscription) -> StoreResult<()> {
        let outgoing = to_json(&sub.outgoing_flows)?;
        sqlx::query(
            r#"
            INSERT INTO error_boundary_subscriptions
                (token_id, element_id, error_code, attached_to_ref, cancel_activity, outgoing_flows)
            VALUES ($1,$2,$3,$4,$5,$6)
            ON CONFLICT (token_id, element_id) DO NOTHING
            "#,
        )
        .bind(sub.token_id)
        .bind(&sub.element_id)
        .bind(&sub.error_code)
        .bind(&sub.attached_to_ref)
        .bind(sub.cancel_activity)
        .bind(outgoing)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_error_boundaries_for_token(&self, token_id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM error_boundary_subscriptions WHERE token_id = $1")
            .bind(token_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_error_boundaries_for_token(
        &self,
        token_id: Uuid,
    ) -> StoreResult<Vec<ErrorBoundarySubscription>> {
        let rows = sqlx::query("SELECT * FROM error_boundary_subscriptions WHERE token_id = $1")
            .bind(token_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| {
                let outgoing: serde_json::Value = row.try_get("outgoing_flows").map_err(map_sqlx)?;
                Ok(ErrorBoundarySubscription {
                    token_id: row.try_get("token_id").map_err(map_sqlx)?,
                    element_id: row.try_get("element_id").map_err(map_sqlx)?,
                    error_code: row.try_get("error_code").map_err(map_sqlx)?,
                    attached_to_ref: row.try_get("attached_to_ref").map_err(map_sqlx)?,
                    cancel_activity: row.try_get("cancel_activity").map_err(map_sqlx)?,
                    outgoing_flows: from_json(outgoing)?,
                })
            })
            .collect()
    }

    async fn save_timer(&self, timer: &TimerRecord) -> StoreResult<()> {
        let kind = to_json(&timer.kind)?;
        let state = to_json(&timer.state)?;
        let spec = to_json(&timer.spec)?;
        sqlx::query(
            r#"
            INSERT INTO timers (timer_id, token_id, element_id, instance_id, kind, state, due_at, spec, attached_to, cancel_activity)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            ON CONFLICT (timer_id) DO UPDATE SET state = EXCLUDED.state
            "#,
        )
        .bind(timer.id)
        .bind(timer.token_id)
        .bind(&timer.element_id)
        .bind(timer.instance_id)
        .bind(kind.as_str().unwrap_or_default())
        .bind(state.as_str().unwrap_or_default())
        .bind(timer.due_at)
        .bind(spec)
        .bind(&timer.attached_to)
        .bind(timer.cancel_activity)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_timer(&self, timer: &TimerRecord) -> StoreResult<()> {
        self.save_timer(timer).await
    }

    async fn load_timer(&self, id: Uuid) -> StoreResult<TimerRecord> {
        let row = sqlx::query("SELECT * FROM timers WHERE timer_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or(StoreError::NotFound)?;
        row_to_timer(&row)
    }

    async fn load_timers_for_token(&self, token_id: Uuid) -> StoreResult<Vec<TimerRecord>> {
        let rows = sqlx::query("SELECT * FROM timers WHERE token_id = $1")
            .bind(token_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_timer).collect()
    }

    async fn load_all_timers(&self) -> StoreResult<Vec<TimerRecord>> {
        let rows = sqlx::query("SELECT * FROM timers")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_timer).collect()
    }

    async fn load_gateway_sync(
        &self,
        gateway_id: &str,
        instance_id: Uuid,
    ) -> StoreResult<Option<GatewaySyncState>> {
        let row = sqlx::query("SELECT * FROM gateway_sync_state WHERE gateway_id = $1 AND instance_id = $2")
            .bind(gateway_id)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.map(|r| row_to_gateway_sync(&r)).transpose()
    }

    async fn gateway_arrive(
        &self,
        gateway_id: &str,
        instance_id: Uuid,
        flow_id: &str,
        required_incoming_count: usize,
    ) -> StoreResult<GatewaySyncState> {
        let row = sqlx::query(
            r#"
            INSERT INTO gateway_sync_state (gateway_id, instance_id, arrived_from_flows, required_incoming_count)
            VALUES ($1, $2, to_jsonb(ARRAY[$3::text]), $4)
            ON CONFLICT (gateway_id, instance_id) DO UPDATE
                SET arrived_from_flows = gateway_sync_state.arrived_from_flows || to_jsonb(ARRAY[$3::text])
            RETURNING *
            "#,
        )
        .bind(gateway_id)
        .bind(instance_id)
        .bind(flow_id)
        .bind(required_incoming_count as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row_to_gateway_sync(&row)
    }

    async fn delete_gateway_sync(&self, gateway_id: &str, instance_id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM gateway_sync_state WHERE gateway_id = $1 AND instance_id = $2")
            .bind(gateway_id)
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn buffer_message(&self, msg: &BufferedMessage) -> StoreResult<()> {
        let variables = msg.variables.clone().into_json();
        sqlx::query(
            r#"
            INSERT INTO buffered_messages (message_name, correlation_key, sequence, variables, buffered_at, ttl_ms)
            VALUES ($1,$2,$3,$4,$5,$6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&msg.message_name)
        .bind(&msg.correlation_key)
        .bind(msg.sequence as i64)
        .bind(variables)
        .bind(msg.buffered_at)
        .bind(msg.ttl.as_millis() as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn take_buffered_message(
        &self,
        message_name: &str,
        correlation_key: &str,
    ) -> StoreResult<Option<BufferedMessage>> {
        let row = sqlx::query(
            r#"
            DELETE FROM buffered_messages
            WHERE (message_name, correlation_key, sequence) = (
                SELECT message_name, correlation_key, sequence FROM buffered_messages
                WHERE message_name = $1 AND correlation_key = $2
                  AND buffered_at + (ttl_ms || ' milliseconds')::interval > now()
                ORDER BY sequence ASC LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(message_name)
        .bind(correlation_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|r| row_to_buffered(&r)).transpose()
    }

    async fn append_event(&self, instance_id: Uuid, event: &CoreEvent) -> StoreResult<u64> {
        event.trace();
        let payload = to_json(event)?;
        let row = sqlx::query(
            r#"
            INSERT INTO event_log (instance_id, seq, event)
            VALUES ($1, COALESCE((SELECT MAX(seq) FROM event_log WHERE instance_id = $1), 0) + 1, $2)
            RETURNING seq
            "#,
        )
        .bind(instance_id)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let seq: i64 = row.try_get("seq").map_err(map_sqlx)?;
        Ok(seq as u64)
    }

    async fn load_events(&self, instance_id: Uuid) -> StoreResult<Vec<(u64, CoreEvent)>> {
        let rows = sqlx::query("SELECT seq, event FROM event_log WHERE instance_id = $1 ORDER BY seq ASC")
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| {
                let seq: i64 = row.try_get("seq").map_err(map_sqlx)?;
                let event: serde_json::Value = row.try_get("event").map_err(map_sqlx)?;
                Ok((seq as u64, from_json(event)?))
            })
            .collect()
    }

    async fn save_incident(&self, incident: &Incident) -> StoreResult<()> {
        let incident_type = to_json(&incident.incident_type)?;
        sqlx::query(
            r#"
            INSERT INTO incidents (
                incident_id, incident_type, message, instance_id, element_id, element_type,
                job_id, error_code, original_retries, created_at, resolved_at, resolution
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
            "#,
        )
        .bind(incident.id)
        .bind(incident_type.as_str().unwrap_or_default())
        .bind(&incident.message)
        .bind(incident.instance_id)
        .bind(&incident.element_id)
        .bind(&incident.element_type)
        .bind(incident.job_id)
        .bind(&incident.error_code)
        .bind(incident.original_retries.map(|r| r as i32))
        .bind(incident.created_at)
        .bind(incident.resolved_at)
        .bind(&incident.resolution)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_incidents(&self, instance_id: Uuid) -> StoreResult<Vec<Incident>> {
        let rows = sqlx::query("SELECT * FROM incidents WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_incident).collect()
    }

    async fn resolve_incident(&self, incident_id: Uuid, resolution: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE incidents SET resolved_at = now(), resolution = $1 WHERE incident_id = $2",
        )
        .bind(resolution)
        .bind(incident_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_message_sub(row: &sqlx::postgres::PgRow) -> StoreResult<MessageSubscription> {
    Ok(MessageSubscription {
        id: row.try_get("sub_id").map_err(map_sqlx)?,
        definition_key: row.try_get("definition_key").map_err(map_sqlx)?,
        start_event_id: row.try_get("start_event_id").map_err(map_sqlx)?,
        token_id: row.try_get("token_id").map_err(map_sqlx)?,
        message_name: row.try_get("message_name").map_err(map_sqlx)?,
        correlation_key: row.try_get("correlation_key").map_err(map_sqlx)?,
        active: row.try_get("active").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        element_id: row.try_get("element_id").map_err(map_sqlx)?,
        cancel_activity: row.try_get("cancel_activity").map_err(map_sqlx)?,
    })
}

fn row_to_signal_sub(row: &sqlx::postgres::PgRow) -> StoreResult<SignalSubscription> {
    let variables: serde_json::Value = row.try_get("variables").map_err(map_sqlx)?;
    Ok(SignalSubscription {
        id: row.try_get("sub_id").map_err(map_sqlx)?,
        signal_name: row.try_get("signal_name").map_err(map_sqlx)?,
        token_id: row.try_get("token_id").map_err(map_sqlx)?,
        element_id: row.try_get("element_id").map_err(map_sqlx)?,
        cancel_activity: row.try_get("cancel_activity").map_err(map_sqlx)?,
        variables: crate::vars::Variables::from_json(variables),
    })
}

fn row_to_timer(row: &sqlx::postgres::PgRow) -> StoreResult<TimerRecord> {
    let kind_str: String = row.try_get("kind").map_err(map_sqlx)?;
    let state_str: String = row.try_get("state").map_err(map_sqlx)?;
    let spec: serde_json::Value = row.try_get("spec").map_err(map_sqlx)?;
    Ok(TimerRecord {
        id: row.try_get("timer_id").map_err(map_sqlx)?,
        token_id: row.try_get("token_id").map_err(map_sqlx)?,
        element_id: row.try_get("element_id").map_err(map_sqlx)?,
        instance_id: row.try_get("instance_id").map_err(map_sqlx)?,
        kind: from_json(serde_json::Value::String(kind_str))?,
        state: from_json(serde_json::Value::String(state_str))?,
        due_at: row.try_get("due_at").map_err(map_sqlx)?,
        spec: from_json(spec)?,
        attached_to: row.try_get("attached_to").map_err(map_sqlx)?,
        cancel_activity: row.try_get("cancel_activity").map_err(map_sqlx)?,
    })
}

fn row_to_gateway_sync(row: &sqlx::postgres::PgRow) -> StoreResult<GatewaySyncState> {
    let arrived: serde_json::Value = row.try_get("arrived_from_flows").map_err(map_sqlx)?;
    let required: i32 = row.try_get("required_incoming_count").map_err(map_sqlx)?;
    Ok(GatewaySyncState {
        gateway_id: row.try_get("gateway_id").map_err(map_sqlx)?,
        instance_id: row.try_get("instance_id").map_err(map_sqlx)?,
        arrived_from_flows: from_json(arrived)?,
        required_incoming_count: required as usize,
    })
}

fn row_to_buffered(row: &sqlx::postgres::PgRow) -> StoreResult<BufferedMessage> {
    let variables: serde_json::Value = row.try_get("variables").map_err(map_sqlx)?;
    let ttl_ms: i64 = row.try_get("ttl_ms").map_err(map_sqlx)?;
    Ok(BufferedMessage {
        message_name: row.try_get("message_name").map_err(map_sqlx)?,
        correlation_key: row.try_get("correlation_key").map_err(map_sqlx)?,
        sequence: row.try_get::<i64, _>("sequence").map_err(map_sqlx)? as u64,
        variables: crate::vars::Variables::from_json(variables),
        buffered_at: row.try_get("buffered_at").map_err(map_sqlx)?,
        ttl: std::time::Duration::from_millis(ttl_ms as u64),
    })
}

fn row_to_incident(row: &sqlx::postgres::PgRow) -> StoreResult<Incident> {
    let incident_type_str: String = row.try_get("incident_type").map_err(map_sqlx)?;
    Ok(Incident {
        id: row.try_get("incident_id").map_err(map_sqlx)?,
        incident_type: from_json(serde_json::Value::String(incident_type_str))?,
        message: row.try_get("message").map_err(map_sqlx)?,
        instance_id: row.try_get("instance_id").map_err(map_sqlx)?,
        element_id: row.try_get("element_id").map_err(map_sqlx)?,
        element_type: row.try_get("element_type").map_err(map_sqlx)?,
        job_id: row.try_get("job_id").map_err(map_sqlx)?,
        error_code: row.try_get("error_code").map_err(map_sqlx)?,
        original_retries: row.try_get::<Option<i32>, _>("original_retries").map_err(map_sqlx)?.map(|v| v as u32),
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        resolved_at: row.try_get("resolved_at").map_err(map_sqlx)?,
        resolution: row.try_get("resolution").map_err(map_sqlx)?,
    })
}
