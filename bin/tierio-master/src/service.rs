//! Block master gRPC service implementation
//!
//! Thin wrappers that translate between the wire types and the metadata
//! engine; all semantics live in [`BlockMaster`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tierio_block_master::{BlockMaster, WorkerCommand};
use tierio_common::{BlockId, Error, WorkerNetAddress};
use tierio_proto::master as pb;
use tierio_proto::master::block_master_client_service_server::BlockMasterClientService;
use tierio_proto::master::block_master_worker_service_server::BlockMasterWorkerService;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

fn to_status(err: Error) -> Status {
    match err {
        Error::BlockNotFound { .. } => Status::not_found(err.to_string()),
        Error::NoWorker { .. } => Status::failed_precondition(err.to_string()),
        Error::Unavailable(_) => Status::unavailable(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

fn address_from_proto(address: pb::WorkerNetAddress) -> Result<WorkerNetAddress, Status> {
    let rpc_port = u16::try_from(address.rpc_port)
        .map_err(|_| Status::invalid_argument("rpc_port out of range"))?;
    let data_port = u16::try_from(address.data_port)
        .map_err(|_| Status::invalid_argument("data_port out of range"))?;
    Ok(WorkerNetAddress::new(address.host, rpc_port, data_port))
}

fn address_to_proto(address: &WorkerNetAddress) -> pb::WorkerNetAddress {
    pb::WorkerNetAddress {
        host: address.host.clone(),
        rpc_port: u32::from(address.rpc_port),
        data_port: u32::from(address.data_port),
    }
}

fn block_info_to_proto(info: tierio_block_master::BlockInfo) -> pb::BlockInfo {
    pb::BlockInfo {
        block_id: info.block_id.as_u64(),
        length: info.length,
        locations: info
            .locations
            .into_iter()
            .map(|location| pb::BlockLocation {
                worker_id: location.worker_id.as_u64(),
                worker_address: Some(address_to_proto(&location.worker_address)),
                tier_alias: location.tier_alias,
            })
            .collect(),
    }
}

fn worker_info_to_proto(info: tierio_block_master::WorkerInfo) -> pb::WorkerInfo {
    pb::WorkerInfo {
        worker_id: info.id.as_u64(),
        address: Some(address_to_proto(&info.address)),
        last_contact_sec: info.last_contact_sec,
        capacity_bytes: info.capacity_bytes,
        used_bytes: info.used_bytes,
        capacity_bytes_on_tiers: info.capacity_bytes_on_tiers,
        used_bytes_on_tiers: info.used_bytes_on_tiers,
    }
}

fn blocks_on_tiers_from_proto(
    blocks_on_tiers: HashMap<String, pb::BlockIdList>,
) -> HashMap<String, Vec<BlockId>> {
    blocks_on_tiers
        .into_iter()
        .map(|(tier_alias, list)| {
            (
                tier_alias,
                list.block_ids.into_iter().map(BlockId::from).collect(),
            )
        })
        .collect()
}

fn command_to_proto(command: WorkerCommand) -> pb::Command {
    match command {
        WorkerCommand::Nothing => pb::Command {
            command_type: pb::CommandType::CommandNothing as i32,
            block_ids: Vec::new(),
        },
        WorkerCommand::Register => pb::Command {
            command_type: pb::CommandType::CommandRegister as i32,
            block_ids: Vec::new(),
        },
        WorkerCommand::Free { block_ids } => pb::Command {
            command_type: pb::CommandType::CommandFree as i32,
            block_ids: block_ids.iter().map(BlockId::as_u64).collect(),
        },
    }
}

/// Client-facing block master service.
pub struct ClientService {
    master: Arc<BlockMaster>,
}

impl ClientService {
    pub fn new(master: Arc<BlockMaster>) -> Self {
        Self { master }
    }
}

#[tonic::async_trait]
impl BlockMasterClientService for ClientService {
    async fn get_new_container_id(
        &self,
        _request: Request<pb::GetNewContainerIdRequest>,
    ) -> Result<Response<pb::GetNewContainerIdResponse>, Status> {
        let container_id = self.master.get_new_container_id().map_err(to_status)?;
        Ok(Response::new(pb::GetNewContainerIdResponse { container_id }))
    }

    async fn get_block_info(
        &self,
        request: Request<pb::GetBlockInfoRequest>,
    ) -> Result<Response<pb::GetBlockInfoResponse>, Status> {
        let req = request.into_inner();
        let info = self
            .master
            .get_block_info(BlockId::from(req.block_id))
            .map_err(to_status)?;
        Ok(Response::new(pb::GetBlockInfoResponse {
            block_info: Some(block_info_to_proto(info)),
        }))
    }

    async fn get_block_info_list(
        &self,
        request: Request<pb::GetBlockInfoListRequest>,
    ) -> Result<Response<pb::GetBlockInfoListResponse>, Status> {
        let req = request.into_inner();
        let block_ids: Vec<BlockId> = req.block_ids.into_iter().map(BlockId::from).collect();
        let infos = self
            .master
            .get_block_info_list(&block_ids)
            .map_err(to_status)?;
        Ok(Response::new(pb::GetBlockInfoListResponse {
            block_infos: infos.into_iter().map(block_info_to_proto).collect(),
        }))
    }

    async fn get_worker_info_list(
        &self,
        _request: Request<pb::GetWorkerInfoListRequest>,
    ) -> Result<Response<pb::GetWorkerInfoListResponse>, Status> {
        let infos = self.master.get_worker_info_list().map_err(to_status)?;
        Ok(Response::new(pb::GetWorkerInfoListResponse {
            worker_infos: infos.into_iter().map(worker_info_to_proto).collect(),
        }))
    }

    async fn get_lost_worker_info_list(
        &self,
        _request: Request<pb::GetLostWorkerInfoListRequest>,
    ) -> Result<Response<pb::GetLostWorkerInfoListResponse>, Status> {
        let infos = self.master.get_lost_worker_info_list();
        Ok(Response::new(pb::GetLostWorkerInfoListResponse {
            worker_infos: infos.into_iter().map(worker_info_to_proto).collect(),
        }))
    }

    async fn get_capacity_bytes(
        &self,
        _request: Request<pb::GetCapacityBytesRequest>,
    ) -> Result<Response<pb::GetCapacityBytesResponse>, Status> {
        Ok(Response::new(pb::GetCapacityBytesResponse {
            bytes: self.master.get_capacity_bytes(),
        }))
    }

    async fn get_used_bytes(
        &self,
        _request: Request<pb::GetUsedBytesRequest>,
    ) -> Result<Response<pb::GetUsedBytesResponse>, Status> {
        Ok(Response::new(pb::GetUsedBytesResponse {
            bytes: self.master.get_used_bytes(),
        }))
    }

    async fn get_capacity_bytes_on_tiers(
        &self,
        _request: Request<pb::GetCapacityBytesOnTiersRequest>,
    ) -> Result<Response<pb::GetCapacityBytesOnTiersResponse>, Status> {
        Ok(Response::new(pb::GetCapacityBytesOnTiersResponse {
            bytes_on_tiers: self.master.get_total_bytes_on_tiers(),
        }))
    }

    async fn get_used_bytes_on_tiers(
        &self,
        _request: Request<pb::GetUsedBytesOnTiersRequest>,
    ) -> Result<Response<pb::GetUsedBytesOnTiersResponse>, Status> {
        Ok(Response::new(pb::GetUsedBytesOnTiersResponse {
            bytes_on_tiers: self.master.get_used_bytes_on_tiers(),
        }))
    }
}

/// Worker-facing block master service.
pub struct WorkerService {
    master: Arc<BlockMaster>,
}

impl WorkerService {
    pub fn new(master: Arc<BlockMaster>) -> Self {
        Self { master }
    }
}

#[tonic::async_trait]
impl BlockMasterWorkerService for WorkerService {
    async fn get_worker_id(
        &self,
        request: Request<pb::GetWorkerIdRequest>,
    ) -> Result<Response<pb::GetWorkerIdResponse>, Status> {
        let req = request.into_inner();
        let address = req
            .worker_address
            .ok_or_else(|| Status::invalid_argument("worker_address is required"))?;
        let worker_id = self.master.get_worker_id(&address_from_proto(address)?);
        Ok(Response::new(pb::GetWorkerIdResponse {
            worker_id: worker_id.as_u64(),
        }))
    }

    async fn register_worker(
        &self,
        request: Request<pb::RegisterWorkerRequest>,
    ) -> Result<Response<pb::RegisterWorkerResponse>, Status> {
        let req = request.into_inner();
        self.master
            .worker_register(
                req.worker_id.into(),
                req.storage_tiers,
                req.total_bytes_on_tiers,
                req.used_bytes_on_tiers,
                blocks_on_tiers_from_proto(req.current_blocks_on_tiers),
            )
            .map_err(to_status)?;
        Ok(Response::new(pb::RegisterWorkerResponse {}))
    }

    async fn worker_heartbeat(
        &self,
        request: Request<pb::WorkerHeartbeatRequest>,
    ) -> Result<Response<pb::WorkerHeartbeatResponse>, Status> {
        let req = request.into_inner();
        let removed_block_ids: Vec<BlockId> =
            req.removed_block_ids.into_iter().map(BlockId::from).collect();
        let command = self.master.worker_heartbeat(
            req.worker_id.into(),
            req.used_bytes_on_tiers,
            &removed_block_ids,
            &blocks_on_tiers_from_proto(req.added_blocks_on_tiers),
        );
        debug!("heartbeat from worker {}: {:?}", req.worker_id, command);
        Ok(Response::new(pb::WorkerHeartbeatResponse {
            command: Some(command_to_proto(command)),
        }))
    }

    async fn commit_block(
        &self,
        request: Request<pb::CommitBlockRequest>,
    ) -> Result<Response<pb::CommitBlockResponse>, Status> {
        let req = request.into_inner();
        self.master
            .commit_block(
                req.worker_id.into(),
                req.used_bytes_on_tier,
                &req.tier_alias,
                BlockId::from(req.block_id),
                req.length,
            )
            .map_err(to_status)?;
        Ok(Response::new(pb::CommitBlockResponse {}))
    }

    async fn commit_block_in_ufs(
        &self,
        request: Request<pb::CommitBlockInUfsRequest>,
    ) -> Result<Response<pb::CommitBlockInUfsResponse>, Status> {
        let req = request.into_inner();
        self.master
            .commit_block_in_ufs(BlockId::from(req.block_id), req.length)
            .map_err(to_status)?;
        Ok(Response::new(pb::CommitBlockInUfsResponse {}))
    }
}

/// Run the lost-worker detection sweep on a fixed period.
pub fn spawn_lost_worker_detector(master: Arc<BlockMaster>, period: Duration) -> JoinHandle<()> {
    info!("lost worker detection every {:?}", period);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            master.detect_lost_workers();
        }
    })
}
