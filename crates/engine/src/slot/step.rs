// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slot state machine transitions
//!
//! [`step`] runs one transition: it performs at most one bounded action
//! against the container or localizer and returns the next state. The
//! slot loop calls it repeatedly with the latest assignment and profile
//! requests folded in.

use super::state::{DynamicState, MachineState, StaticState};
use crate::error::SlotError;
use crate::metrics::KillReason;
use slotd_adapters::{ContainerHandle, ContainerLauncher, Localizer};
use slotd_core::{equivalent, Clock, LocalAssignment, TopoProfileAction};
use std::collections::HashSet;

/// Advance the state machine by one transition.
///
/// Recoverable collaborator errors are logged and the step is retried from
/// the unchanged state after a short pause. Fatal errors are returned.
pub async fn step<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    let snapshot = ds.clone();
    let result = match ds.state() {
        MachineState::Empty => handle_empty(ds, ss).await,
        MachineState::WaitingForBlobLocalization => {
            handle_waiting_for_blob_localization(ds, ss).await
        }
        MachineState::WaitingForBlobUpdate => handle_waiting_for_blob_update(ds, ss).await,
        MachineState::WaitingForWorkerStart => handle_waiting_for_worker_start(ds, ss).await,
        MachineState::Running => handle_running(ds, ss).await,
        MachineState::Kill => handle_kill(ds, ss).await,
        MachineState::KillAndRelaunch => handle_kill_and_relaunch(ds, ss).await,
        MachineState::KillBlobUpdate => handle_kill_blob_update(ds, ss).await,
    };

    match result {
        Ok(next) => {
            next.validate()?;
            Ok(next)
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(
                port = ss.port,
                state = %snapshot.state(),
                error = %e,
                "step failed, will retry"
            );
            ss.sleep(ss.config.poll_granularity).await;
            Ok(snapshot)
        }
    }
}

async fn handle_empty<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    if !equivalent(ds.new_assignment(), ds.current_assignment()) {
        return Ok(prepare_for_new_assignment(ds, ss).await);
    }

    if !ds.profile_actions().is_empty() {
        tracing::warn!(
            port = ss.port,
            count = ds.profile_actions().len(),
            "dropping profile actions, nothing is running"
        );
    }
    let ds = drain_all_changing_blobs(ds).with_profile_actions(HashSet::new(), HashSet::new());
    ss.sleep(ss.config.poll_granularity).await;
    Ok(ds)
}

async fn handle_waiting_for_blob_localization<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    let Some(pending) = ds.pending_localization().cloned() else {
        return Err(SlotError::InvariantViolation(
            "waiting for localization without a pending download".to_string(),
        ));
    };
    if ds.container().is_some() {
        return Err(SlotError::InvariantViolation(
            "localizing while a container is running".to_string(),
        ));
    }

    let mut ds = filter_changing_blobs_for(ds, Some(&pending.assignment));
    if !ds.changing_blobs().is_empty() {
        ds = inform_changed_blobs(ds, &pending.assignment);
    }

    // In-flight downloads are never cancelled; a stale one is released
    // once it completes
    let Some(result) = pending.download.wait_timeout(ss.config.poll_granularity).await else {
        return Ok(ds);
    };

    if let Err(e) = result {
        tracing::warn!(
            port = ss.port,
            topology_id = %pending.assignment.topology_id,
            error = %e,
            "blob download failed"
        );
        return Ok(retry_later(ds, ss, &pending.assignment).await);
    }

    if !equivalent(ds.new_assignment(), Some(&pending.assignment)) {
        tracing::info!(
            port = ss.port,
            from = %pending.assignment.topology_id,
            to = ?ds.new_assignment().map(|a| &a.topology_id),
            "assignment changed while localizing"
        );
        release(ss, &pending.assignment).await;
        let ds = drop_pending_changing_blobs_for(ds, &pending.assignment)
            .with_pending_localization(None);
        return Ok(prepare_for_new_assignment(ds, ss).await);
    }

    if !ds.pending_changing_blobs().is_empty() {
        tracing::info!(
            port = ss.port,
            pending = ds.pending_changing_blobs().len(),
            "blob updates pending, waiting before launch"
        );
        return Ok(ds
            .with_pending_localization(None)
            .with_state(MachineState::WaitingForBlobUpdate, ss.clock.now()));
    }

    let target = ds
        .new_assignment()
        .cloned()
        .unwrap_or(pending.assignment);
    Ok(launch(ds, ss, target).await)
}

async fn handle_waiting_for_blob_update<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    let Some(target) = ds.pending_changing_blobs_assignment().cloned() else {
        return Err(SlotError::InvariantViolation(
            "waiting for blob update with nothing pending".to_string(),
        ));
    };
    if ds.container().is_some() {
        return Err(SlotError::InvariantViolation(
            "waiting for blob update while a container is running".to_string(),
        ));
    }

    if !equivalent(ds.new_assignment(), Some(&target)) {
        tracing::info!(
            port = ss.port,
            from = %target.topology_id,
            to = ?ds.new_assignment().map(|a| &a.topology_id),
            "assignment changed while waiting for blob update"
        );
        release(ss, &target).await;
        let ds = ds.with_pending_changing_blobs(Vec::new(), None);
        return Ok(prepare_for_new_assignment(ds, ss).await);
    }

    let mut ds = filter_changing_blobs_for(ds, Some(&target));
    if !ds.changing_blobs().is_empty() {
        ds = inform_changed_blobs(ds, &target);
    }

    let deadline = tokio::time::Instant::now() + ss.config.poll_granularity;
    let mut still_pending = Vec::new();
    let mut failure = None;
    for update in ds.pending_changing_blobs() {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        match update.wait_timeout(left).await {
            Some(Ok(())) => {}
            Some(Err(e)) => failure = Some(e),
            None => still_pending.push(update.clone()),
        }
    }

    if let Some(e) = failure {
        tracing::warn!(
            port = ss.port,
            topology_id = %target.topology_id,
            error = %e,
            "blob update failed"
        );
        return Ok(retry_later(ds, ss, &target).await);
    }
    if !still_pending.is_empty() {
        return Ok(ds.with_pending_changing_blobs(still_pending, Some(target)));
    }

    let target = ds.new_assignment().cloned().unwrap_or(target);
    Ok(launch(ds, ss, target).await)
}

async fn handle_waiting_for_worker_start<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    let (container, current) = running_pair(&ds)?;

    if let Some(heartbeat) = container.read_heartbeat().await? {
        if heartbeat.is_fresh(ss.clock.epoch_millis(), millis(ss.config.heartbeat_timeout)) {
            tracing::info!(
                port = ss.port,
                worker_id = %container.worker_id(),
                waited_ms = millis(ds.time_in_state(ss.clock.now())),
                "worker started"
            );
            return Ok(ds.with_state(MachineState::Running, ss.clock.now()));
        }
    }

    if !equivalent(ds.new_assignment(), Some(&current)) {
        return kill_container_for(KillReason::AssignmentChanged, ds, ss).await;
    }
    let ds = update_assignment_if_needed(ds, ss);

    let ds = filter_changing_blobs_for(ds, Some(&current));
    if !ds.changing_blobs().is_empty() {
        return kill_container_for(KillReason::BlobChanged, ds, ss).await;
    }

    if container.did_main_process_exit().await? {
        tracing::warn!(
            port = ss.port,
            worker_id = %container.worker_id(),
            "worker exited before its first heartbeat"
        );
        return kill_container_for(KillReason::ProcessExit, ds, ss).await;
    }

    if ds.time_in_state(ss.clock.now()) > ss.config.first_heartbeat_timeout {
        tracing::warn!(
            port = ss.port,
            worker_id = %container.worker_id(),
            timeout_ms = millis(ss.config.first_heartbeat_timeout),
            "worker failed to start"
        );
        ss.metrics.worker_start_timed_out(ss.port);
        return kill_container_for(KillReason::HeartbeatTimeout, ds, ss).await;
    }

    ss.sleep(ss.config.poll_granularity).await;
    Ok(ds)
}

async fn handle_running<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    let (container, current) = running_pair(&ds)?;

    if !equivalent(ds.new_assignment(), Some(&current)) {
        return kill_container_for(KillReason::AssignmentChanged, ds, ss).await;
    }
    let ds = update_assignment_if_needed(ds, ss);

    let ds = filter_changing_blobs_for(ds, Some(&current));
    if !ds.changing_blobs().is_empty() {
        return kill_container_for(KillReason::BlobChanged, ds, ss).await;
    }

    if container.did_main_process_exit().await? {
        return kill_container_for(KillReason::ProcessExit, ds, ss).await;
    }

    if container.is_memory_limit_violated(&current).await? {
        return kill_container_for(KillReason::MemoryViolation, ds, ss).await;
    }

    match container.read_heartbeat().await? {
        None => return kill_container_for(KillReason::HeartbeatMissing, ds, ss).await,
        Some(heartbeat)
            if !heartbeat
                .is_fresh(ss.clock.epoch_millis(), millis(ss.config.heartbeat_timeout)) =>
        {
            tracing::warn!(
                port = ss.port,
                age_ms = heartbeat.age_millis(ss.clock.epoch_millis()),
                "worker heartbeat timed out"
            );
            return kill_container_for(KillReason::HeartbeatTimeout, ds, ss).await;
        }
        Some(_) => {}
    }

    let ds = service_profile_actions(ds, ss, &container, &current).await;

    if let Some(sample) = container.process_metrics().await {
        ss.metrics.worker_memory(ss.port, sample.rss_mb);
    }

    ss.sleep(ss.config.monitor_frequency).await;
    Ok(ds)
}

async fn handle_kill<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    let (container, _) = running_pair(&ds)?;
    let next = ds.pending_localization().map(|p| p.assignment.clone());
    let ds = filter_changing_blobs_for(ds, next.as_ref());

    if container.are_all_processes_dead().await? {
        tracing::info!(port = ss.port, worker_id = %container.worker_id(), "worker is dead");
        let state = if ds.pending_localization().is_some() {
            MachineState::WaitingForBlobLocalization
        } else {
            MachineState::Empty
        };
        return cleanup_current_container(ds, ss, Some(state)).await;
    }

    force_kill_and_wait(ds, ss, &container).await
}

async fn handle_kill_and_relaunch<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    let (container, current) = running_pair(&ds)?;
    let ds = filter_changing_blobs_for(ds, Some(&current));

    if container.are_all_processes_dead().await? {
        if equivalent(ds.new_assignment(), Some(&current)) {
            container.clean_up_for_restart().await?;
            container.relaunch().await?;
            ss.metrics.worker_relaunched(ss.port);
            return Ok(ds.with_state(MachineState::WaitingForWorkerStart, ss.clock.now()));
        }
        return prepare_for_new_assignment_on_empty_slot(ds, ss).await;
    }

    check_kill_ceiling(&ds, ss, &container)?;
    force_kill_and_wait(ds, ss, &container).await
}

async fn handle_kill_blob_update<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    let (container, current) = running_pair(&ds)?;
    let ds = filter_changing_blobs_for(ds, Some(&current));

    if container.are_all_processes_dead().await? {
        if !equivalent(ds.new_assignment(), Some(&current)) {
            return prepare_for_new_assignment_on_empty_slot(ds, ss).await;
        }

        // The blob references stay held: the pending update owns them now
        container.clean_up().await?;
        let ds = inform_changed_blobs(ds.with_current_assignment(None), &current);
        if ds.pending_changing_blobs().is_empty() {
            release(ss, &current).await;
            return Ok(prepare_for_new_assignment(ds, ss).await);
        }
        return Ok(ds.with_state(MachineState::WaitingForBlobUpdate, ss.clock.now()));
    }

    check_kill_ceiling(&ds, ss, &container)?;
    force_kill_and_wait(ds, ss, &container).await
}

/// Request blobs for the new assignment, or go idle if there is none.
///
/// Request errors fall back to `Empty`, which asks again.
async fn prepare_for_new_assignment<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> DynamicState
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    let now = ss.clock.now();
    let Some(assignment) = ds.new_assignment().cloned() else {
        return ds.with_state(MachineState::Empty, now);
    };

    match ss
        .localizer
        .request_download_topology_blobs(&assignment, ss.port, ss.changing_callback.clone())
        .await
    {
        Ok(download) => ds
            .with_pending_localization(Some((assignment, download)))
            .with_state(MachineState::WaitingForBlobLocalization, now),
        Err(e) => {
            tracing::warn!(
                port = ss.port,
                topology_id = %assignment.topology_id,
                error = %e,
                "blob download request failed"
            );
            ss.sleep(ss.config.poll_granularity).await;
            ds.with_state(MachineState::Empty, now)
        }
    }
}

async fn prepare_for_new_assignment_on_empty_slot<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    let ds = cleanup_current_container(ds, ss, None).await?;
    Ok(prepare_for_new_assignment(ds, ss).await)
}

async fn launch<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
    assignment: LocalAssignment,
) -> DynamicState
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    match ss
        .launcher
        .launch_container(ss.port, &assignment, &ss.local_state)
        .await
    {
        Ok(container) => {
            ss.metrics.worker_launched(ss.port);
            ds.with_pending_localization(None)
                .with_pending_changing_blobs(Vec::new(), None)
                .with_current_assignment(Some((container, assignment)))
                .with_state(MachineState::WaitingForWorkerStart, ss.clock.now())
        }
        Err(e) => {
            tracing::warn!(
                port = ss.port,
                topology_id = %assignment.topology_id,
                error = %e,
                "worker launch failed"
            );
            retry_later(ds, ss, &assignment).await
        }
    }
}

/// Give up on `assignment` for now: drop its references and go idle after
/// the retry delay. `Empty` starts over if it is still wanted.
async fn retry_later<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
    assignment: &LocalAssignment,
) -> DynamicState
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    release(ss, assignment).await;
    let ds = ds
        .with_pending_localization(None)
        .with_pending_changing_blobs(Vec::new(), None);
    ss.sleep(ss.config.download_retry).await;
    ds.with_state(MachineState::Empty, ss.clock.now())
}

/// Kill the running worker and pick the state that follows
async fn kill_container_for<L, C, S, K>(
    reason: KillReason,
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    let (container, current) = running_pair(&ds)?;
    tracing::info!(
        port = ss.port,
        worker_id = %container.worker_id(),
        topology_id = %current.topology_id,
        %reason,
        "killing worker"
    );
    container.kill().await?;
    ss.metrics.worker_killed(ss.port, reason);

    let (next, localization) = match reason {
        KillReason::AssignmentChanged => {
            let localization = match ds.new_assignment().cloned() {
                Some(assignment) => match ss
                    .localizer
                    .request_download_topology_blobs(
                        &assignment,
                        ss.port,
                        ss.changing_callback.clone(),
                    )
                    .await
                {
                    Ok(download) => Some((assignment, download)),
                    Err(e) => {
                        // Empty asks again once the worker is gone
                        tracing::warn!(port = ss.port, error = %e, "blob download request failed");
                        None
                    }
                },
                None => None,
            };
            (MachineState::Kill, localization)
        }
        KillReason::BlobChanged => (MachineState::KillBlobUpdate, None),
        _ => (MachineState::KillAndRelaunch, None),
    };

    let mut actions = ds.profile_actions().clone();
    if reason.relaunches() {
        // Restart profiling once the worker is back
        actions.extend(ds.pending_stop_profile_actions().iter().cloned());
    }

    Ok(ds
        .with_state(next, ss.clock.now())
        .with_pending_localization(localization)
        .with_profile_actions(actions, HashSet::new()))
}

/// Release a dead container and its blob references
async fn cleanup_current_container<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
    next: Option<MachineState>,
) -> Result<DynamicState, SlotError>
where
    L: Localizer,
    C: ContainerLauncher,
    S: Send + Sync,
    K: Clock,
{
    let (container, current) = running_pair(&ds)?;
    container.clean_up().await?;
    release(ss, &current).await;

    let ds = ds.with_current_assignment(None);
    Ok(match next {
        Some(state) => ds.with_state(state, ss.clock.now()),
        None => ds,
    })
}

async fn force_kill_and_wait<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
    container: &ContainerHandle,
) -> Result<DynamicState, SlotError>
where
    S: Send + Sync,
    K: Clock,
{
    tracing::warn!(port = ss.port, worker_id = %container.worker_id(), "force kill and wait");
    ss.metrics.force_kill(ss.port);
    container.force_kill().await?;
    ss.sleep(ss.config.kill_sleep).await;
    Ok(ds)
}

fn check_kill_ceiling<L, C, S, K: Clock>(
    ds: &DynamicState,
    ss: &StaticState<L, C, S, K>,
    container: &ContainerHandle,
) -> Result<(), SlotError> {
    let waited = ds.time_in_state(ss.clock.now());
    if waited > ss.config.kill_ceiling {
        return Err(SlotError::Fatal(format!(
            "worker {} on port {} did not exit {}s after being killed",
            container.worker_id(),
            ss.port,
            waited.as_secs()
        )));
    }
    Ok(())
}

async fn release<L: Localizer, C, S, K>(
    ss: &StaticState<L, C, S, K>,
    assignment: &LocalAssignment,
) {
    if let Err(e) = ss.localizer.release_slot_for(assignment, ss.port).await {
        tracing::warn!(
            port = ss.port,
            topology_id = %assignment.topology_id,
            error = %e,
            "releasing blob references failed"
        );
    }
}

/// Adopt an equivalent new assignment without restarting the worker
fn update_assignment_if_needed<L, C, S, K>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
) -> DynamicState {
    let updated = match (ds.new_assignment(), ds.current_assignment()) {
        (Some(new), Some(current)) if new != current => {
            tracing::info!(
                port = ss.port,
                topology_id = %new.topology_id,
                from_owner = %current.owner,
                to_owner = %new.owner,
                "assignment updated in place"
            );
            Some(new.clone())
        }
        _ => None,
    };
    match updated {
        Some(new) => ds.with_updated_current_assignment(new),
        None => ds,
    }
}

/// Keep blob-change notices for `assignment`'s topology; acknowledge the rest
pub(crate) fn filter_changing_blobs_for(
    ds: DynamicState,
    assignment: Option<&LocalAssignment>,
) -> DynamicState {
    if ds.changing_blobs().is_empty() {
        return ds;
    }
    let kept = ds
        .changing_blobs()
        .iter()
        .filter(|change| {
            let keep = assignment.is_some_and(|a| change.assignment.is_same_topology(a));
            if !keep {
                change.ack.acknowledge();
            }
            keep
        })
        .cloned()
        .collect();
    ds.with_changing_blobs(kept)
}

pub(crate) fn drain_all_changing_blobs(ds: DynamicState) -> DynamicState {
    filter_changing_blobs_for(ds, None)
}

/// Acknowledge every notice, tracking the updates for `assignment` so the
/// worker is only started once they finish
fn inform_changed_blobs(ds: DynamicState, assignment: &LocalAssignment) -> DynamicState {
    let mut waiting = ds.pending_changing_blobs().to_vec();
    for change in ds.changing_blobs() {
        let update = change.ack.acknowledge();
        if change.assignment.is_same_topology(assignment) {
            waiting.push(update);
        }
    }
    let owner = if waiting.is_empty() {
        None
    } else {
        Some(assignment.clone())
    };
    ds.with_changing_blobs(Vec::new())
        .with_pending_changing_blobs(waiting, owner)
}

fn drop_pending_changing_blobs_for(ds: DynamicState, assignment: &LocalAssignment) -> DynamicState {
    match ds.pending_changing_blobs_assignment() {
        Some(owner) if owner.is_same_topology(assignment) => {
            ds.with_pending_changing_blobs(Vec::new(), None)
        }
        _ => ds,
    }
}

/// Start, stop and complete profile actions against the running worker.
///
/// Failed actions stay outstanding and are retried on the next pass.
async fn service_profile_actions<L, C, S, K: Clock>(
    ds: DynamicState,
    ss: &StaticState<L, C, S, K>,
    container: &ContainerHandle,
    current: &LocalAssignment,
) -> DynamicState {
    if ds.profile_actions().is_empty() {
        return ds;
    }

    let mut actions: HashSet<TopoProfileAction> = ds.profile_actions().clone();
    let mut pending_stop: HashSet<TopoProfileAction> = ds.pending_stop_profile_actions().clone();
    let now_millis = ss.clock.epoch_millis();

    for action in ds.profile_actions() {
        if action.topology_id != current.topology_id {
            tracing::warn!(port = ss.port, %action, "dropping profile action for another topology");
            actions.remove(action);
            continue;
        }

        if pending_stop.contains(action) {
            if !action.is_time_to_stop(now_millis) {
                continue;
            }
            if container.run_profiling(&action.request, true).await {
                tracing::debug!(port = ss.port, %action, "profiling stopped");
                actions.remove(action);
                pending_stop.remove(action);
            } else {
                tracing::warn!(port = ss.port, %action, "stopping profiler failed, will retry");
            }
            continue;
        }

        if action.request.action.is_timed() && action.is_time_to_stop(now_millis) {
            tracing::debug!(port = ss.port, %action, "dropping expired profile action");
            actions.remove(action);
            continue;
        }

        if container.run_profiling(&action.request, false).await {
            if action.request.action.is_timed() {
                tracing::debug!(port = ss.port, %action, "profiling started");
                pending_stop.insert(action.clone());
            } else {
                tracing::debug!(port = ss.port, %action, "profile action finished");
                actions.remove(action);
            }
        } else {
            tracing::warn!(port = ss.port, %action, "profile action failed, will retry");
        }
    }

    ds.with_profile_actions(actions, pending_stop)
}

fn running_pair(ds: &DynamicState) -> Result<(ContainerHandle, LocalAssignment), SlotError> {
    match (ds.container(), ds.current_assignment()) {
        (Some(container), Some(current)) => Ok((container.clone(), current.clone())),
        _ => Err(SlotError::InvariantViolation(format!(
            "{} without a running container",
            ds.state()
        ))),
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(test)]
#[path = "step_tests.rs"]
mod tests;
