//! Gateway contract ABI definition
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the gateway that
//! emits outbound transfers and executes inbound ones.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Token gateway deployed on every relayed chain
    #[sol(rpc)]
    contract RelayGateway {
        /// Emitted by `sendToken` on the source chain
        ///
        /// # Arguments
        /// * `sender` - Account whose tokens were locked or burned
        /// * `destinationChain` - Configured name of the destination chain
        /// * `destinationAddress` - Recipient on the destination chain as a hex string
        /// * `symbol` - Token symbol registered on both gateways
        /// * `amount` - Amount in token base units
        event TokenSent(
            address indexed sender,
            string destinationChain,
            string destinationAddress,
            string symbol,
            uint256 amount
        );

        /// Lock or burn tokens and request delivery on another chain
        function sendToken(
            string destinationChain,
            string destinationAddress,
            string symbol,
            uint256 amount
        ) external;

        /// Deliver a relayed transfer. Reverts when `commandId` was already executed.
        function executeTokenTransfer(
            bytes32 commandId,
            string sourceChain,
            address sender,
            address recipient,
            string symbol,
            uint256 amount
        ) external;

        /// Whether `commandId` has been executed on this gateway
        function isCommandExecuted(bytes32 commandId) external view returns (bool);
    }
}
