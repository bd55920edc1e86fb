//! Batch and transaction execution
//!
//! Interactions run method group by method group (see
//! [`crate::services::translator::METHOD_ORDER`]). Each group goes through
//! three phases:
//!
//! 1. meta: resolve write targets, assign ids, record local references;
//! 2. reference mapping: rewrite `urn:` references in request bodies;
//! 3. persist: store writes and run reads, searches and operations.
//!
//! A transaction runs everything in one session and aborts on the first
//! failure. A batch records failures in the entry's response slot; its meta
//! phase shares a session per group and every persisted entry gets a session
//! of its own.

use crate::interaction::{Interaction, InteractionKind};
use crate::models::{BundleEntry, BundleEntryResponse, OperationOutcome};
use crate::persistence::PersistenceSession;
use crate::services::references::{FrozenReferenceMap, LocalReferenceMap};
use crate::services::rest::{
    finish, MetaOutcome, PreparedWrite, RequestContext, RestHelper, RestOperationResponse,
    UpdateRequest,
};
use crate::services::translator::METHOD_ORDER;
use crate::Result;
use axum::http::{Method, StatusCode};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Response entry for a failed bundle entry.
pub fn error_entry(err: &crate::Error) -> BundleEntry {
    issue_entry(err.status(), &err.to_operation_outcome())
}

fn issue_entry(status: StatusCode, outcome: &OperationOutcome) -> BundleEntry {
    BundleEntry {
        resource: Some(outcome.to_value()),
        response: Some(BundleEntryResponse {
            status: status.as_u16().to_string(),
            outcome: Some(outcome.to_value()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One write-once slot per request entry.
#[derive(Debug)]
pub struct ResponseSlots {
    slots: Vec<Option<BundleEntry>>,
}

impl ResponseSlots {
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size],
        }
    }

    pub fn is_filled(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Some(_)))
    }

    pub fn fill(&mut self, index: usize, entry: BundleEntry) -> Result<()> {
        match self.slots.get_mut(index) {
            None => Err(crate::Error::Internal(format!(
                "response slot {} is out of range",
                index
            ))),
            Some(Some(_)) => Err(crate::Error::Internal(format!(
                "response slot {} was already filled",
                index
            ))),
            Some(slot) => {
                *slot = Some(entry);
                Ok(())
            }
        }
    }

    /// Every slot must be filled by now.
    pub fn into_entries(self) -> Result<Vec<BundleEntry>> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| {
                    crate::Error::Internal(format!("no response was produced for bundle entry {}", index))
                })
            })
            .collect()
    }
}

/// State carried across the phases of one bundle.
pub struct ExecutionContext<'a> {
    request: &'a RequestContext,
    transaction: bool,
    local_refs: LocalReferenceMap,
    slots: ResponseSlots,
    prepared: HashMap<usize, PreparedWrite>,
    /// Operation bodies after reference rewriting.
    rewritten: HashMap<usize, JsonValue>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        request: &'a RequestContext,
        transaction: bool,
        local_refs: LocalReferenceMap,
        size: usize,
    ) -> Self {
        Self {
            request,
            transaction,
            local_refs,
            slots: ResponseSlots::new(size),
            prepared: HashMap::new(),
            rewritten: HashMap::new(),
        }
    }

    /// Record a failed entry. Fatal for a transaction.
    fn fail(&mut self, interaction: &Interaction, err: crate::Error) -> Result<()> {
        if self.transaction {
            return Err(err.with_entry_context(
                interaction.entry_index,
                interaction.request_description.clone(),
            ));
        }
        let err = err.into_root();
        tracing::info!(
            entry_index = interaction.entry_index,
            status = err.status().as_u16(),
            elapsed_ms = interaction.elapsed_ms() as u64,
            description = %interaction.request_description,
            error = %err,
            "Bundle entry failed"
        );
        self.prepared.remove(&interaction.entry_index);
        self.slots.fill(interaction.entry_index, error_entry(&err))
    }

    fn complete(&mut self, interaction: &Interaction, response: RestOperationResponse) -> Result<()> {
        let entry = self.entry(interaction, response);
        self.slots.fill(interaction.entry_index, entry)
    }

    fn entry(&self, interaction: &Interaction, response: RestOperationResponse) -> BundleEntry {
        tracing::info!(
            entry_index = interaction.entry_index,
            status = response.status.as_u16(),
            elapsed_ms = interaction.elapsed_ms() as u64,
            description = %interaction.request_description,
            "Bundle entry completed"
        );
        let mut entry = response.into_entry(self.request);
        if is_head(interaction) {
            entry.resource = None;
        }
        entry
    }
}

fn is_head(interaction: &Interaction) -> bool {
    matches!(
        interaction.kind,
        InteractionKind::Read { head: true, .. }
            | InteractionKind::VRead { head: true, .. }
            | InteractionKind::Search { head: true, .. }
            | InteractionKind::History { head: true, .. }
    )
}

/// Run the translated interactions of a bundle and return the response
/// entries in request order.
#[tracing::instrument(skip_all, fields(transaction = transaction, entries = size))]
pub async fn execute(
    helper: &RestHelper,
    request: &RequestContext,
    interactions: Vec<Interaction>,
    local_refs: LocalReferenceMap,
    transaction: bool,
    size: usize,
) -> Result<Vec<BundleEntry>> {
    let mut ctx = ExecutionContext::new(request, transaction, local_refs, size);

    let mut groups: Vec<Vec<Interaction>> = METHOD_ORDER.iter().map(|_| Vec::new()).collect();
    for interaction in interactions {
        let index = interaction.entry_index;
        match interaction.kind {
            InteractionKind::ValidationOutcome { response } => {
                ctx.slots.fill(index, response)?;
            }
            InteractionKind::Issue { status, outcome } => {
                ctx.slots.fill(index, issue_entry(status, &outcome))?;
            }
            _ => {
                let position = METHOD_ORDER
                    .iter()
                    .position(|m| *m == interaction.method)
                    .ok_or_else(|| {
                        crate::Error::Internal(format!(
                            "unexpected bundle method {}",
                            interaction.method
                        ))
                    })?;
                groups[position].push(interaction);
            }
        }
    }

    if transaction {
        let mut session = helper.persistence().begin().await?;
        let result = async {
            for group in &groups {
                run_transaction_group(helper, &mut ctx, group, session.as_mut()).await?;
            }
            Ok::<_, crate::Error>(())
        }
        .await;
        finish(session, result).await?;
        tracing::info!(entries = size, "Transaction committed");
    } else {
        for group in &groups {
            run_batch_group(helper, &mut ctx, group).await?;
        }
    }

    ctx.slots.into_entries()
}

async fn run_transaction_group(
    helper: &RestHelper,
    ctx: &mut ExecutionContext<'_>,
    group: &[Interaction],
    session: &mut dyn PersistenceSession,
) -> Result<()> {
    for interaction in group {
        if let Err(err) = run_meta(helper, ctx, interaction, session).await {
            ctx.fail(interaction, err)?;
        }
    }

    let frozen = ctx.local_refs.freeze();
    for interaction in group {
        if let Err(err) = run_reference_mapping(ctx, interaction, &frozen) {
            ctx.fail(interaction, err)?;
        }
    }

    for interaction in group {
        match run_persist(helper, ctx, interaction, session).await {
            Ok(Some(response)) => ctx.complete(interaction, response)?,
            Ok(None) => {}
            Err(err) => ctx.fail(interaction, err)?,
        }
    }
    Ok(())
}

async fn run_batch_group(
    helper: &RestHelper,
    ctx: &mut ExecutionContext<'_>,
    group: &[Interaction],
) -> Result<()> {
    if group.is_empty() {
        return Ok(());
    }

    let mut session = helper.persistence().begin().await?;
    let result = async {
        for interaction in group {
            if let Err(err) = run_meta(helper, ctx, interaction, session.as_mut()).await {
                ctx.fail(interaction, err)?;
            }
        }
        Ok::<_, crate::Error>(())
    }
    .await;
    finish(session, result).await?;

    let frozen = ctx.local_refs.freeze();
    for interaction in group {
        if let Err(err) = run_reference_mapping(ctx, interaction, &frozen) {
            ctx.fail(interaction, err)?;
        }
    }

    for interaction in group {
        if ctx.slots.is_filled(interaction.entry_index) {
            continue;
        }
        let outcome = match helper.persistence().begin().await {
            Ok(mut session) => {
                let result = run_persist(helper, ctx, interaction, session.as_mut()).await;
                finish(session, result).await
            }
            Err(err) => Err(err),
        };
        match outcome {
            Ok(Some(response)) => ctx.complete(interaction, response)?,
            Ok(None) => {}
            Err(err) => ctx.fail(interaction, err)?,
        }
    }
    Ok(())
}

/// Meta phase: resolve create, update and patch targets. Writes that need no
/// persisting (conditional create hit, skipped update, 304) fill their slot
/// here.
async fn run_meta(
    helper: &RestHelper,
    ctx: &mut ExecutionContext<'_>,
    interaction: &Interaction,
    session: &mut dyn PersistenceSession,
) -> Result<()> {
    let index = interaction.entry_index;
    if ctx.slots.is_filled(index) {
        return Ok(());
    }

    let outcome = match &interaction.kind {
        InteractionKind::Create {
            resource_type,
            resource,
            if_none_exist,
        } => {
            helper
                .prepare_create(session, resource_type, resource, if_none_exist.as_deref())
                .await?
        }
        InteractionKind::Update {
            resource_type,
            id,
            resource,
            search_query,
            if_match,
            if_none_match,
            skippable,
        } => {
            let snapshot = ctx.local_refs.freeze();
            let request = UpdateRequest::update(resource_type, id.as_deref(), resource)
                .search_query(search_query.as_deref())
                .if_match(if_match.as_deref())
                .if_none_match(if_none_match.is_some())
                .skippable(*skippable)
                .force_create(interaction.method == Method::POST);
            helper.prepare_update(session, &request, Some(&snapshot)).await?
        }
        InteractionKind::Patch {
            resource_type,
            id,
            patch,
            if_match,
            skippable,
        } => {
            let request = UpdateRequest::patch(resource_type, Some(id), patch)
                .if_match(if_match.as_deref())
                .skippable(*skippable);
            helper.prepare_update(session, &request, None).await?
        }
        _ => return Ok(()),
    };

    match outcome {
        MetaOutcome::Write(write) => {
            if let Some(local) = &interaction.local_identifier {
                ctx.local_refs
                    .register(local, format!("{}/{}", write.resource_type, write.id))?;
            }
            ctx.prepared.insert(index, write);
        }
        MetaOutcome::Completed(response) => {
            if let (Some(local), Some(reference)) =
                (&interaction.local_identifier, response.reference())
            {
                ctx.local_refs.register(local, reference)?;
            }
            ctx.complete(interaction, response)?;
        }
    }
    Ok(())
}

/// Reference mapping phase: rewrite local references in prepared writes and
/// operation bodies.
fn run_reference_mapping(
    ctx: &mut ExecutionContext<'_>,
    interaction: &Interaction,
    frozen: &FrozenReferenceMap,
) -> Result<()> {
    let index = interaction.entry_index;
    if ctx.slots.is_filled(index) {
        return Ok(());
    }

    if let Some(write) = ctx.prepared.get_mut(&index) {
        write.resource = frozen.rewrite(&write.resource)?;
    } else if let InteractionKind::Invoke {
        resource: Some(body),
        ..
    } = &interaction.kind
    {
        ctx.rewritten.insert(index, frozen.rewrite(body)?);
    }
    Ok(())
}

/// Persist phase. Returns `None` when the slot was already filled.
async fn run_persist(
    helper: &RestHelper,
    ctx: &mut ExecutionContext<'_>,
    interaction: &Interaction,
    session: &mut dyn PersistenceSession,
) -> Result<Option<RestOperationResponse>> {
    let index = interaction.entry_index;
    if ctx.slots.is_filled(index) {
        return Ok(None);
    }
    if let Some(write) = ctx.prepared.remove(&index) {
        return helper.persist_write(session, write).await.map(Some);
    }

    let request = ctx.request;
    let response = match &interaction.kind {
        InteractionKind::Delete {
            resource_type,
            id,
            search_query,
        } => {
            helper
                .delete_in(session, resource_type, id.as_deref(), search_query.as_deref())
                .await?
        }
        InteractionKind::Read {
            resource_type, id, ..
        } => {
            let current = helper.read_in(session, resource_type, id).await?;
            RestOperationResponse::for_resource(StatusCode::OK, &current)
        }
        InteractionKind::VRead {
            resource_type,
            id,
            version_id,
            ..
        } => {
            let found = helper.vread_in(session, resource_type, id, version_id).await?;
            RestOperationResponse::for_resource(StatusCode::OK, &found)
        }
        InteractionKind::Search {
            resource_type,
            compartment,
            query,
            request_uri,
            ..
        } => {
            let compartment = compartment.as_ref().map(|(c, id)| (c.as_str(), id.as_str()));
            let bundle = helper
                .search_in(session, request, resource_type.as_deref(), compartment, query, request_uri)
                .await?;
            RestOperationResponse::for_bundle(&bundle)?
        }
        InteractionKind::History {
            resource_type,
            id,
            query,
            request_uri,
            ..
        } => {
            let bundle = helper
                .history_in(session, request, resource_type.as_deref(), id.as_deref(), query, request_uri)
                .await?;
            RestOperationResponse::for_bundle(&bundle)?
        }
        InteractionKind::Invoke {
            operation_name,
            context,
            resource,
            query,
            ..
        } => {
            let body = ctx.rewritten.remove(&index).or_else(|| resource.clone());
            helper
                .invoke_in(session, request, operation_name, context, body.as_ref(), query)
                .await?
        }
        InteractionKind::Create { .. }
        | InteractionKind::Update { .. }
        | InteractionKind::Patch { .. } => {
            return Err(crate::Error::Internal(format!(
                "no prepared write for bundle entry {}",
                index
            )))
        }
        InteractionKind::ValidationOutcome { .. } | InteractionKind::Issue { .. } => {
            return Ok(None)
        }
    };
    Ok(Some(response))
}
