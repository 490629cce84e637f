//! Contract bindings for the on-chain reward surface.
//!
//! Human-readable ABI fragments cover exactly the methods and events the
//! oracle consumes; the contracts themselves live outside this repository.

use ethers::prelude::abigen;

abigen!(
    AgentRegistry,
    r#"[
        function getActiveAgents() external view returns (address[])
        function getAllAgents() external view returns (address[])
        function getAgent(address agent) external view returns (bytes32 nodeId, string metadata, uint256 registeredAt, uint256 lastHeartbeat, uint8 status, uint256 stake)
    ]"#
);

abigen!(
    RewardPool,
    r#"[
        function getCurrentEpoch() external view returns (uint256)
        function reportContribution(address agent, uint256 taskCount, uint256 uptime, uint256 responseScore, uint256 processedTokens, uint256 avgLatencyInv) external
        function syncRewards() external
        function distributeRewards(uint256 epoch) external
        function epochDistributed(uint256 epoch) external view returns (bool)
        function epochReward(uint256 epoch) external view returns (uint256)
        function getEpochAgents(uint256 epoch) external view returns (address[])
        function getEpochContribution(uint256 epoch, address agent) external view returns (uint256 taskCount, uint256 uptime, uint256 responseScore, uint256 processedTokens, uint256 avgLatencyInv)
        function getPendingReward(address agent) external view returns (uint256)
    ]"#
);

abigen!(
    ChallengeManager,
    r#"[
        function getCurrentChallenge() external view returns (bytes32 id, uint8 difficulty, bytes32 seed, uint256 createdAt, uint256 expiresAt, bool solved, address solver, uint256 rewardBonus)
        function createChallenge(uint8 difficulty, bytes32 seed, uint256 duration) external
        function getChallengeHistory(uint256 offset, uint256 count) external view returns (bytes32[])
        event ChallengeCreated(bytes32 indexed id, uint8 difficulty, uint256 expiresAt)
        event ChallengeSolved(bytes32 indexed id, address indexed solver, uint256 solveTime)
    ]"#
);
