// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The stage chain requests travel through.
//!
//! A [`StreamStack`] is an ordered list of [`StreamStackEntry`] stages. Every
//! stage method receives a [`Next`] (or [`NextRef`]) cursor to the rest of the
//! chain; the default implementations forward, so a stage only overrides the
//! operations it cares about. Past the last stage the cursor supplies the
//! terminal behaviour: prepared requests land in the context's prepared queue,
//! and queued requests nobody claimed are failed or completed depending on
//! [`RequestCommand::fails_when_unhandled`].

use std::sync::Arc;
use std::time::Instant;

use ember_core::io::RequestStatus;

use super::context::StreamerContext;
use super::request::{FailureReason, FileRequestPtr, RequestCommand};
use super::statistics::Statistic;

/// Capacity report gathered from the stack before queueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// How many more requests the stack accepts right now.
    pub num_available_slots: i64,
    /// `true` when no stage holds work.
    pub is_idle: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            num_available_slots: i64::MAX,
            is_idle: true,
        }
    }
}

/// A stage of the stream stack.
pub trait StreamStackEntry: Send {
    /// Name used in logs and statistics.
    fn name(&self) -> &str;

    /// Called when the stage joins a stack or the stack's context changes.
    fn set_context(&mut self, context: &Arc<StreamerContext>) {
        let _ = context;
    }

    /// Lets the stage inspect or rewrite a request right after submission.
    fn prepare_request(&mut self, request: FileRequestPtr, next: Next<'_>) {
        next.prepare_request(request);
    }

    /// Offers a request for execution. The stage either takes ownership of
    /// it or forwards it.
    fn queue_request(&mut self, request: FileRequestPtr, next: Next<'_>) {
        next.queue_request(request);
    }

    /// Performs pending work. Returns `true` if anything was executed.
    fn execute_requests(&mut self, next: Next<'_>) -> bool {
        next.execute_requests()
    }

    /// Narrows the stack's capacity report.
    fn update_status(&self, status: &mut Status, next: NextRef<'_>) {
        next.update_status(status);
    }

    /// Refreshes completion estimates of the requests the stage holds.
    ///
    /// `internal_pending` are requests already queued in the stack, `pending`
    /// the prepared ones still waiting for a slot.
    fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &[FileRequestPtr],
        pending: &[FileRequestPtr],
        next: Next<'_>,
    ) {
        next.update_completion_estimates(now, internal_pending, pending);
    }

    /// Appends the stage's statistics.
    fn collect_statistics(&self, statistics: &mut Vec<Statistic>, next: NextRef<'_>) {
        next.collect_statistics(statistics);
    }
}

type Stage = Box<dyn StreamStackEntry>;

/// Mutable cursor to the stages after the current one.
pub struct Next<'a> {
    stages: &'a mut [Stage],
    context: &'a Arc<StreamerContext>,
}

impl<'a> Next<'a> {
    /// The context shared by the whole stack.
    pub fn context(&self) -> &Arc<StreamerContext> {
        self.context
    }

    /// Returns `true` if no stage follows.
    pub fn is_terminal(&self) -> bool {
        self.stages.is_empty()
    }

    /// Reborrows the cursor, so it can be used more than once.
    pub fn by_ref(&mut self) -> Next<'_> {
        Next {
            stages: &mut *self.stages,
            context: self.context,
        }
    }

    /// Fails a cancelled request on its way between stages.
    fn finish_if_cancelled(&self, request: &FileRequestPtr) -> bool {
        if !request.is_cancelled() || request.status().is_terminal() {
            return false;
        }
        log::trace!("Request {} canceled between stages", request.id());
        request.fail(FailureReason::Canceled);
        self.context.mark_request_as_completed(request.clone());
        true
    }

    pub fn prepare_request(self, request: FileRequestPtr) {
        if self.finish_if_cancelled(&request) {
            return;
        }
        match self.stages.split_first_mut() {
            Some((stage, rest)) => stage.prepare_request(
                request,
                Next {
                    stages: rest,
                    context: self.context,
                },
            ),
            None => self.context.push_prepared_request(request),
        }
    }

    pub fn queue_request(self, request: FileRequestPtr) {
        if self.finish_if_cancelled(&request) {
            return;
        }
        match self.stages.split_first_mut() {
            Some((stage, rest)) => stage.queue_request(
                request,
                Next {
                    stages: rest,
                    context: self.context,
                },
            ),
            None => {
                let (fails, name) = {
                    let command: &RequestCommand = &request.command();
                    (command.fails_when_unhandled(), command.name())
                };
                if fails {
                    log::warn!(
                        "{} request {} reached the end of the stack unhandled",
                        name,
                        request.id()
                    );
                    request.fail(FailureReason::Unhandled);
                } else {
                    request.complete();
                }
                self.context.mark_request_as_completed(request);
            }
        }
    }

    pub fn execute_requests(self) -> bool {
        match self.stages.split_first_mut() {
            Some((stage, rest)) => stage.execute_requests(Next {
                stages: rest,
                context: self.context,
            }),
            None => false,
        }
    }

    pub fn update_completion_estimates(
        self,
        now: Instant,
        internal_pending: &[FileRequestPtr],
        pending: &[FileRequestPtr],
    ) {
        if let Some((stage, rest)) = self.stages.split_first_mut() {
            stage.update_completion_estimates(
                now,
                internal_pending,
                pending,
                Next {
                    stages: rest,
                    context: self.context,
                },
            );
        }
    }

    /// A read-only view of the rest of the chain.
    pub fn as_next_ref(&self) -> NextRef<'_> {
        NextRef {
            stages: &*self.stages,
        }
    }
}

/// Read-only cursor to the stages after the current one.
#[derive(Clone, Copy)]
pub struct NextRef<'a> {
    stages: &'a [Stage],
}

impl NextRef<'_> {
    pub fn is_terminal(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn update_status(self, status: &mut Status) {
        if let Some((stage, rest)) = self.stages.split_first() {
            stage.update_status(status, NextRef { stages: rest });
        }
    }

    pub fn collect_statistics(self, statistics: &mut Vec<Statistic>) {
        if let Some((stage, rest)) = self.stages.split_first() {
            stage.collect_statistics(statistics, NextRef { stages: rest });
        }
    }
}

/// An ordered chain of stages sharing one [`StreamerContext`].
pub struct StreamStack {
    stages: Vec<Stage>,
    context: Arc<StreamerContext>,
}

impl StreamStack {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            stages: Vec::new(),
            context,
        }
    }

    /// Appends a stage at the device end of the chain.
    pub fn push_stage(&mut self, stage: impl StreamStackEntry + 'static) {
        self.push_boxed_stage(Box::new(stage));
    }

    pub fn push_boxed_stage(&mut self, mut stage: Box<dyn StreamStackEntry>) {
        stage.set_context(&self.context);
        log::debug!("Stream stack: added stage '{}'", stage.name());
        self.stages.push(stage);
    }

    /// Builder form of [`push_stage`](Self::push_stage).
    pub fn with_stage(mut self, stage: impl StreamStackEntry + 'static) -> Self {
        self.push_stage(stage);
        self
    }

    /// Replaces the context and hands it to every stage.
    pub fn set_context(&mut self, context: Arc<StreamerContext>) {
        self.context = context;
        for stage in &mut self.stages {
            stage.set_context(&self.context);
        }
    }

    pub fn context(&self) -> &Arc<StreamerContext> {
        &self.context
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn head(&mut self) -> Next<'_> {
        Next {
            stages: &mut self.stages,
            context: &self.context,
        }
    }

    pub fn prepare_request(&mut self, request: FileRequestPtr) {
        self.head().prepare_request(request);
    }

    pub fn queue_request(&mut self, request: FileRequestPtr) {
        if !request.status().is_terminal() {
            request.set_status(RequestStatus::Queued);
        }
        self.head().queue_request(request);
    }

    pub fn execute_requests(&mut self) -> bool {
        self.head().execute_requests()
    }

    pub fn update_status(&self) -> Status {
        let mut status = Status::default();
        NextRef {
            stages: &self.stages,
        }
        .update_status(&mut status);
        status
    }

    pub fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &[FileRequestPtr],
        pending: &[FileRequestPtr],
    ) {
        self.head()
            .update_completion_estimates(now, internal_pending, pending);
    }

    pub fn collect_statistics(&self) -> Vec<Statistic> {
        let mut statistics = Vec::new();
        NextRef {
            stages: &self.stages,
        }
        .collect_statistics(&mut statistics);
        statistics
    }
}
