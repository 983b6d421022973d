// Licensed under the MIT License.

//! The command-processing engine: doorbell reconciliation, opcode dispatch,
//! and completion posting.

use crate::ADMIN_QUEUE_ID;
use crate::MAX_QES;
use crate::error::CommandResult;
use crate::error::NvmeError;
use crate::prp::PrpRange;
use crate::queue::CQ_ENTRY_SIZE;
use crate::queue::Queue;
use crate::queue::SQ_ENTRY_SIZE;
use crate::registers::ControllerRegisters;
use crate::registers::DoorbellKind;
use crate::spec;
use host_mem::HostMemory;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Every distinct 16-bit CID; a submission queue's used-CID set resets once
/// it grows to this.
const MAX_COMMAND_IDENTIFIERS: usize = 1 << 16;

/// The engine's state: the valid queue arenas plus per-queue CID and
/// phase-tag tracking. All of it is private to the engine task; the one lock
/// around the engine is the critical section.
pub(crate) struct Engine {
    mem: HostMemory,
    regs: Arc<ControllerRegisters>,
    sqs: Vec<Queue>,
    cqs: Vec<Queue>,
    sq_cids: BTreeMap<u16, BTreeSet<u16>>,
    phase_tags: BTreeMap<u16, bool>,
    max_io_queues: u16,
}

impl Engine {
    pub fn new(mem: HostMemory, regs: Arc<ControllerRegisters>, max_io_queues: u16) -> Self {
        Self {
            mem,
            regs,
            sqs: Vec::new(),
            cqs: Vec::new(),
            sq_cids: BTreeMap::new(),
            phase_tags: BTreeMap::new(),
            max_io_queues,
        }
    }

    /// The engine's entry point: reconciles doorbells with shadow state and
    /// processes every fetched command to completion.
    ///
    /// Runs to the end of the sweep once started; the only early returns are
    /// the readiness gates and a lost register subsystem.
    pub fn check_for_changes(&mut self) {
        if !self.regs.csts().rdy() {
            return;
        }

        let asq = self.regs.asq();
        if asq == 0 {
            // The host has not posted an admin submission queue address.
            return;
        }
        if self.sqs.is_empty() {
            let len = self.regs.aqa().asqs_z() as u32 + 1;
            let doorbell = self.regs.doorbell(ADMIN_QUEUE_ID, DoorbellKind::SqTail);
            insert_queue(
                &mut self.sqs,
                Queue::new(ADMIN_QUEUE_ID, len, SQ_ENTRY_SIZE, asq, doorbell),
            );
        } else {
            // The host may move the queue while the controller is disabled.
            self.sq_mut(ADMIN_QUEUE_ID)
                .expect("valid submission queues exist but the admin queue is missing")
                .set_memory_address(asq);
        }

        let acq = self.regs.acq();
        if acq == 0 {
            return;
        }
        if self.cqs.is_empty() {
            let len = self.regs.aqa().acqs_z() as u32 + 1;
            let doorbell = self.regs.doorbell(ADMIN_QUEUE_ID, DoorbellKind::CqHead);
            let mut cq = Queue::new(ADMIN_QUEUE_ID, len, CQ_ENTRY_SIZE, acq, doorbell);
            cq.set_peer(Some(ADMIN_QUEUE_ID));
            insert_queue(&mut self.cqs, cq);
            self.sq_mut(ADMIN_QUEUE_ID)
                .expect("valid submission queues exist but the admin queue is missing")
                .set_peer(Some(ADMIN_QUEUE_ID));
        } else {
            self.cq_mut(ADMIN_QUEUE_ID)
                .expect("valid completion queues exist but the admin queue is missing")
                .set_memory_address(acq);
        }

        // Round-robin over the submission queues in qid order. The qid list
        // is snapshotted because a Delete IO Submission Queue command can
        // remove a queue mid-sweep.
        let qids: Vec<u16> = self.sqs.iter().map(Queue::qid).collect();
        for qid in qids {
            let Some(sq) = self.sq_mut(qid) else {
                continue;
            };
            let doorbell_tail = sq.doorbell().read();
            if doorbell_tail != sq.tail() && !sq.set_tail(doorbell_tail) {
                tracing::error!(
                    qid,
                    tail = doorbell_tail,
                    "invalid tail pointer from doorbell; raising asynchronous event condition"
                );
                continue;
            }
            loop {
                match self.sq(qid) {
                    Some(sq) if !sq.is_empty() => {}
                    _ => break,
                }
                if !self.process_command(qid) {
                    return;
                }
            }
        }
    }

    fn sq(&self, qid: u16) -> Option<&Queue> {
        self.sqs.iter().find(|q| q.qid() == qid)
    }

    fn sq_mut(&mut self, qid: u16) -> Option<&mut Queue> {
        self.sqs.iter_mut().find(|q| q.qid() == qid)
    }

    fn cq_mut(&mut self, qid: u16) -> Option<&mut Queue> {
        self.cqs.iter_mut().find(|q| q.qid() == qid)
    }

    /// Fetches and runs the command at the head of `sqid`, posting its
    /// completion. Returns false if the sweep must be abandoned.
    fn process_command(&mut self, sqid: u16) -> bool {
        if self.regs.memory_page_size() == 0 {
            tracing::error!("unable to read the memory page size; was the register image lost?");
            return false;
        }

        let (command, sqhd) = {
            let addr = {
                let sq = self.sq_mut(sqid).expect("caller checked the queue");
                sq.entry_address(sq.head())
            };
            let command: spec::Command = match self.mem.read_plain(addr) {
                Ok(command) => command,
                Err(err) => {
                    tracing::error!(
                        sqid,
                        error = &err as &dyn std::error::Error,
                        "failed to fetch command from host memory"
                    );
                    return false;
                }
            };
            // The command is consumed here, so completions report the
            // advanced head in SQHD.
            let sq = self.sq_mut(sqid).expect("caller checked the queue");
            sq.advance_head();
            (command, sq.head() as u16)
        };

        let cid = command.cdw0.cid();
        if !self.is_valid_command_identifier(cid, sqid) {
            self.post_completion(
                sqid,
                sqhd,
                cid,
                spec::Status::COMMAND_ID_CONFLICT.into(),
            );
            return true;
        }

        let result = if sqid == ADMIN_QUEUE_ID {
            self.handle_admin_command(&command)
        } else {
            // The NVM command set has no media bank behind it yet.
            tracing::warn!(
                sqid,
                opcode = command.cdw0.opcode(),
                "io command on stubbed nvm path"
            );
            spec::Status::INVALID_COMMAND_OPCODE.into()
        };
        self.post_completion(sqid, sqhd, cid, result);
        true
    }

    fn handle_admin_command(&mut self, command: &spec::Command) -> CommandResult {
        let opcode = spec::AdminOpcode(command.cdw0.opcode());
        tracing::debug!(?opcode, cid = command.cdw0.cid(), "admin command");

        let result = match opcode {
            spec::AdminOpcode::IDENTIFY => {
                self.handle_identify(command).map(|()| CommandResult::default())
            }
            spec::AdminOpcode::KEEP_ALIVE => Ok(CommandResult::default()),
            spec::AdminOpcode::CREATE_IO_COMPLETION_QUEUE => self
                .handle_create_io_completion_queue(command)
                .map(|()| CommandResult::default()),
            spec::AdminOpcode::CREATE_IO_SUBMISSION_QUEUE => self
                .handle_create_io_submission_queue(command)
                .map(|()| CommandResult::default()),
            spec::AdminOpcode::DELETE_IO_SUBMISSION_QUEUE => self
                .handle_delete_io_submission_queue(command)
                .map(|()| CommandResult::default()),
            spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE => self
                .handle_delete_io_completion_queue(command)
                .map(|()| CommandResult::default()),
            opcode => {
                tracing::warn!(?opcode, "unsupported admin opcode");
                Err(spec::Status::INVALID_COMMAND_OPCODE.into())
            }
        };

        match result {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    cid = command.cdw0.cid(),
                    ?opcode,
                    "admin command failed"
                );
                err.into()
            }
        }
    }

    /// Identify transfers one memory page through the command's PRPs. The
    /// payload contents are stubbed pending a media bank.
    fn handle_identify(&mut self, command: &spec::Command) -> Result<(), NvmeError> {
        let mps = self.regs.memory_page_size() as usize;
        let prp = PrpRange::parse(&self.mem, mps, command.dptr, mps)?;
        let mut payload = prp.get_payload_copy(&self.mem)?;
        payload.write_at(0, &[0x01, 0xff]);
        prp.place_payload_in_existing_prps(&self.mem, &payload)?;
        Ok(())
    }

    fn handle_create_io_completion_queue(
        &mut self,
        command: &spec::Command,
    ) -> Result<(), NvmeError> {
        let cdw10 = spec::Cdw10CreateIoQueue::from(command.cdw10);
        let cdw11 = spec::Cdw11CreateIoCompletionQueue::from(command.cdw11);
        if !cdw11.pc() {
            return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
        }
        let qid = cdw10.qid();
        if qid == ADMIN_QUEUE_ID || qid > self.max_io_queues {
            return Err(spec::Status::INVALID_QUEUE_IDENTIFIER.into());
        }
        if self.cqs.iter().any(|q| q.qid() == qid) {
            return Err(spec::Status::INVALID_QUEUE_IDENTIFIER.into());
        }
        let len0 = cdw10.qsize_z();
        if len0 == 0 || len0 >= MAX_QES {
            return Err(spec::Status::INVALID_QUEUE_SIZE.into());
        }
        let gpa = command.dptr[0] & !(self.regs.memory_page_size() - 1);
        let doorbell = self.regs.doorbell(qid, DoorbellKind::CqHead);
        insert_queue(
            &mut self.cqs,
            Queue::new(qid, len0 as u32 + 1, CQ_ENTRY_SIZE, gpa, doorbell),
        );
        Ok(())
    }

    fn handle_create_io_submission_queue(
        &mut self,
        command: &spec::Command,
    ) -> Result<(), NvmeError> {
        let cdw10 = spec::Cdw10CreateIoQueue::from(command.cdw10);
        let cdw11 = spec::Cdw11CreateIoSubmissionQueue::from(command.cdw11);
        if !cdw11.pc() {
            return Err(spec::Status::INVALID_FIELD_IN_COMMAND.into());
        }
        let qid = cdw10.qid();
        if qid == ADMIN_QUEUE_ID || qid > self.max_io_queues {
            return Err(spec::Status::INVALID_QUEUE_IDENTIFIER.into());
        }
        if self.sqs.iter().any(|q| q.qid() == qid) {
            return Err(spec::Status::INVALID_QUEUE_IDENTIFIER.into());
        }
        // Queues pair one to one: the named completion queue must carry this
        // queue's id and must not already be paired.
        let cqid = cdw11.cqid();
        let cq = self.cqs.iter_mut().find(|q| q.qid() == cqid);
        let cq = match cq {
            Some(cq) if cqid == qid && cq.peer().is_none() => cq,
            _ => return Err(spec::Status::COMPLETION_QUEUE_INVALID.into()),
        };
        let len0 = cdw10.qsize_z();
        if len0 == 0 || len0 >= MAX_QES {
            return Err(spec::Status::INVALID_QUEUE_SIZE.into());
        }
        cq.set_peer(Some(qid));
        let gpa = command.dptr[0] & !(self.regs.memory_page_size() - 1);
        let doorbell = self.regs.doorbell(qid, DoorbellKind::SqTail);
        let mut sq = Queue::new(qid, len0 as u32 + 1, SQ_ENTRY_SIZE, gpa, doorbell);
        sq.set_peer(Some(cqid));
        insert_queue(&mut self.sqs, sq);
        Ok(())
    }

    fn handle_delete_io_submission_queue(
        &mut self,
        command: &spec::Command,
    ) -> Result<(), NvmeError> {
        let cdw10 = spec::Cdw10DeleteIoQueue::from(command.cdw10);
        let qid = cdw10.qid();
        if qid == ADMIN_QUEUE_ID || !self.sqs.iter().any(|q| q.qid() == qid) {
            return Err(spec::Status::INVALID_QUEUE_IDENTIFIER.into());
        }
        self.sqs.retain(|q| q.qid() != qid);
        self.sq_cids.remove(&qid);
        if let Some(cq) = self.cq_mut(qid) {
            cq.set_peer(None);
        }
        Ok(())
    }

    fn handle_delete_io_completion_queue(
        &mut self,
        command: &spec::Command,
    ) -> Result<(), NvmeError> {
        let cdw10 = spec::Cdw10DeleteIoQueue::from(command.cdw10);
        let qid = cdw10.qid();
        let Some(cq) = (qid != ADMIN_QUEUE_ID)
            .then(|| self.cqs.iter().find(|q| q.qid() == qid))
            .flatten()
        else {
            return Err(spec::Status::INVALID_QUEUE_IDENTIFIER.into());
        };
        if cq.peer().is_some() {
            // The paired submission queue must be deleted first.
            return Err(spec::Status::INVALID_QUEUE_DELETION.into());
        }
        self.cqs.retain(|q| q.qid() != qid);
        self.phase_tags.remove(&qid);
        Ok(())
    }

    /// Checks and records a command identifier for a submission queue.
    ///
    /// A CID is valid while not present in the queue's used set. Once every
    /// distinct CID has been used the set resets, re-admitting all of them.
    fn is_valid_command_identifier(&mut self, cid: u16, sqid: u16) -> bool {
        let cids = self.sq_cids.entry(sqid).or_default();
        if cids.len() == MAX_COMMAND_IDENTIFIERS {
            tracing::info!(sqid, "every command identifier used; resetting the set");
            cids.clear();
        }
        if cids.insert(cid) {
            true
        } else {
            tracing::error!(cid, sqid, "command identifier reused while outstanding");
            false
        }
    }

    /// Builds the completion entry for a consumed command and writes it to
    /// the peer completion queue, then rings that queue's head doorbell.
    fn post_completion(&mut self, sqid: u16, sqhd: u16, cid: u16, result: CommandResult) {
        let peer = self.sq(sqid).expect("caller checked the queue").peer();
        let cq_index = peer.and_then(|cqid| self.cqs.iter().position(|q| q.qid() == cqid));
        let Some(cq_index) = cq_index else {
            tracing::error!(
                sqid,
                "submission queue has no mapped completion queue, yet it received a command"
            );
            return;
        };

        let cq = &self.cqs[cq_index];
        let cqid = cq.qid();
        let head = cq.head();

        // The phase tag starts at 0 and inverts whenever the write position
        // wraps to slot 0, which includes the very first completion; the
        // first pass over the queue therefore carries phase 1.
        let phase = {
            let phase = self.phase_tags.entry(cqid).or_insert(false);
            if head == 0 {
                *phase = !*phase;
                tracing::debug!(cqid, phase = *phase, "inverting phase tag");
            }
            *phase
        };

        let entry = spec::Completion {
            dw0: result.dw[0],
            dw1: result.dw[1],
            sqhd,
            sqid,
            cid,
            status: spec::CompletionStatus::new()
                .with_phase(phase)
                .with_status(result.status.0)
                .with_dnr(result.dnr),
        };

        let cq = &mut self.cqs[cq_index];
        let remaining = cq.memory_size() - head as u64 * CQ_ENTRY_SIZE as u64;
        assert!(
            remaining >= CQ_ENTRY_SIZE as u64,
            "completion write would overrun the queue region"
        );
        if let Err(err) = self.mem.write_plain(cq.entry_address(head), &entry) {
            tracing::error!(
                cqid,
                error = &err as &dyn std::error::Error,
                "failed to post completion to host memory"
            );
            return;
        }
        tracing::debug!(cqid, head, sqid, cid, "posted completion");

        cq.advance_head();
        // Ring the doorbell only after the entry is in host memory.
        cq.doorbell().write(cq.head());
    }

    /// Drops every non-admin queue and all CID/phase tracking; admin queues
    /// survive with their indices rewound.
    pub fn controller_reset(&mut self) {
        tracing::info!("controller reset");
        self.sqs.retain(|q| q.qid() == ADMIN_QUEUE_ID);
        self.cqs.retain(|q| q.qid() == ADMIN_QUEUE_ID);
        for queue in self.sqs.iter_mut().chain(self.cqs.iter_mut()) {
            queue.reset();
        }
        self.sq_cids.clear();
        self.phase_tags.clear();
    }
}

fn insert_queue(queues: &mut Vec<Queue>, queue: Queue) {
    let index = queues.partition_point(|q| q.qid() < queue.qid());
    queues.insert(index, queue);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> Engine {
        Engine::new(
            HostMemory::allocate(0x1000),
            ControllerRegisters::new(4),
            4,
        )
    }

    #[test]
    fn cid_reuse_rejected_per_queue() {
        let mut engine = test_engine();
        assert!(engine.is_valid_command_identifier(7, 0));
        assert!(!engine.is_valid_command_identifier(7, 0));
        assert!(engine.is_valid_command_identifier(8, 0));
        // Queues track identifiers independently.
        assert!(engine.is_valid_command_identifier(7, 1));
    }

    #[test]
    fn cid_set_resets_when_saturated() {
        let mut engine = test_engine();
        for cid in 0..=u16::MAX {
            assert!(engine.is_valid_command_identifier(cid, 0));
        }
        // The set is saturated; the next admission clears it first, which
        // re-admits previously used identifiers.
        assert!(engine.is_valid_command_identifier(0, 0));
        assert!(engine.is_valid_command_identifier(1, 0));
        assert!(!engine.is_valid_command_identifier(1, 0));
    }
}
